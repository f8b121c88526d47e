use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use image::DynamicImage;
use log::{debug, warn};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::Value;

use crate::coordinates::DetectedElement;
use crate::visual_driver::encode_png;

const EMPTY_DETECTION: &str = "No object detected.";

const DETECTION_PARAMS: [(&str, &str); 4] = [
    ("box_threshold", "0.05"),
    ("iou_threshold", "0.1"),
    ("use_paddleocr", "true"),
    ("imgsz", "640"),
];

/// Turns a screenshot into the list of interactable elements on it.
#[async_trait]
pub trait VisionParser: Send + Sync {
    async fn parse(&self, screenshot: &DynamicImage) -> Result<Vec<DetectedElement>>;
}

/// Client for the screen-parsing service's `/process_image` endpoint.
pub struct HttpVisionClient {
    client: Client,
    base_url: String,
}

impl HttpVisionClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(50))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl VisionParser for HttpVisionClient {
    async fn parse(&self, screenshot: &DynamicImage) -> Result<Vec<DetectedElement>> {
        let png = encode_png(screenshot)?;
        let part = Part::bytes(png).file_name("image.png").mime_str("image/png")?;
        let form = Form::new().part("file", part);
        let url = format!("{}/process_image", self.base_url);

        let res = self
            .client
            .post(&url)
            .query(&DETECTION_PARAMS)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("Vision service unreachable at {}", url))?;

        if !res.status().is_success() {
            return Err(anyhow!("Vision service HTTP error {}", res.status()));
        }

        let body: Value = res.json().await.context("Vision service returned invalid JSON")?;
        if body["status"].as_str() != Some("success") {
            let message = body["message"].as_str().unwrap_or("unknown error");
            return Err(anyhow!("Vision service error: {}", message));
        }

        let elements = parse_detections(&body["parsed_content"]);
        debug!("Vision service detected {} element(s)", elements.len());
        Ok(elements)
    }
}

/// Reads `parsed_content`, either a JSON array of objects or the service's
/// text form with one `label: {...}` entry per line. Empty detections are
/// dropped and ids are renumbered from 0 in order.
pub fn parse_detections(content: &Value) -> Vec<DetectedElement> {
    let raw: Vec<Value> = match content {
        Value::Array(items) => items.clone(),
        Value::String(text) => text.lines().filter_map(parse_detection_line).collect(),
        _ => Vec::new(),
    };

    raw.iter()
        .filter_map(|obj| {
            let content = obj["content"].as_str().unwrap_or_default().trim().to_string();
            if content == EMPTY_DETECTION {
                return None;
            }
            let bbox = read_bbox(&obj["bbox"])?;
            Some((obj["type"].as_str().unwrap_or("unknown").to_string(), content, bbox))
        })
        .enumerate()
        .map(|(id, (kind, content, bbox))| DetectedElement {
            id: id as i64,
            kind,
            content,
            bbox,
        })
        .collect()
}

fn parse_detection_line(line: &str) -> Option<Value> {
    let start = line.find('{')?;
    let end = line.rfind('}')?;
    if end < start {
        return None;
    }
    let json = python_literal_to_json(&line[start..=end]);
    match serde_json::from_str(&json) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Skipping unparseable detection line: {}", e);
            None
        }
    }
}

fn read_bbox(value: &Value) -> Option<[f64; 4]> {
    let items = value.as_array()?;
    if items.len() != 4 {
        return None;
    }
    let mut bbox = [0.0; 4];
    for (slot, item) in bbox.iter_mut().zip(items) {
        *slot = item.as_f64()?;
    }
    Some(bbox)
}

/// Rewrites a Python dict literal (single quotes, `True`/`False`/`None`) as JSON.
fn python_literal_to_json(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut chars = src.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                let quote = c;
                out.push('"');
                while let Some(ch) = chars.next() {
                    match ch {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                match escaped {
                                    '\'' => out.push('\''),
                                    other => {
                                        out.push('\\');
                                        out.push(other);
                                    }
                                }
                            }
                        }
                        '"' if quote == '\'' => out.push_str("\\\""),
                        ch if ch == quote => break,
                        ch => out.push(ch),
                    }
                }
                out.push('"');
            }
            c if c.is_ascii_alphabetic() => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(match word.as_str() {
                    "True" => "true",
                    "False" => "false",
                    "None" => "null",
                    other => other,
                });
            }
            c => out.push(c),
        }
    }
    out
}
