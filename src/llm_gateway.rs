use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::warn;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::action_schema::Action;
use crate::coordinates::DetectedElement;

/// Produces actions from natural-language instructions. Replies are raw text;
/// extraction and validation happen on the engine side.
#[async_trait]
pub trait InstructionSource: Send + Sync {
    /// The single next action for `instruction`, given what already ran and
    /// what is currently on screen.
    async fn next_action(
        &self,
        instruction: &str,
        history: &[Action],
        elements: &[DetectedElement],
    ) -> Result<String>;

    /// A complete ordered workflow for `instruction`.
    async fn plan_workflow(&self, instruction: &str) -> Result<String>;
}

const ACTION_SCHEMA_PROMPT: &str = r#"
You operate a desktop computer one step at a time.
Reply with a single JSON object and nothing else:
{
  "action": "open|click|scroll|input|hotkey|press_enter|finish|delay|move",
  "id": <element id from the list, or -1 when no element is involved>,
  "target": "<short description of the element or intent>",
  "params": {
    "clicks": 1,                     // click only, default 1
    "button_type": "left|right|middle",
    "text_content": "<text>",        // required for input
    "direction": "up|down|left|right", // required for scroll
    "key_sequence": ["ctrl", "c"],   // required for hotkey
    "seconds": 1.0,                  // required for delay
    "x": 0, "y": 0                   // literal screen point, optional
  }
}
"open" double-clicks an element to launch it. "input" clicks the element, clears it,
types the text and presses enter. Reply "finish" once the goal is reached.
"#;

const WORKFLOW_PROMPT: &str = r#"
Plan the complete sequence of desktop actions for the user's goal.
Reply with a JSON object {"actions": [ ... ]} where every entry follows this schema:
{"action": "open|click|scroll|input|hotkey|press_enter|finish|delay|move",
 "id": -1, "target": "<description>", "params": { ... }}
Prefer hotkeys and literal steps that do not depend on on-screen element ids.
"#;

/// OpenAI-compatible chat completions client.
#[derive(Clone)]
pub struct HttpInstructionSource {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpInstructionSource {
    pub fn new(base_url: &str, api_key: Option<&str>, model: &str) -> Result<Self> {
        let api_key = api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| anyhow!("OPENAI_API_KEY not set in .env"))?;
        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    async fn post_with_retry(&self, url: &str, body: &Value) -> Result<reqwest::Response> {
        let max_retries = 3;
        let mut attempt = 0;
        let mut backoff = Duration::from_secs(1);

        loop {
            attempt += 1;
            match self
                .client
                .post(url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(body)
                .send()
                .await
            {
                Ok(resp) => {
                    let retryable = resp.status().is_server_error()
                        || resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS;
                    if !retryable || attempt > max_retries {
                        return Ok(resp);
                    }
                    warn!(
                        "Instruction service returned {} (attempt {}/{}), retrying in {:?}",
                        resp.status(),
                        attempt,
                        max_retries,
                        backoff
                    );
                }
                Err(e) => {
                    if attempt > max_retries {
                        return Err(anyhow!("Max retries exceeded: {}", e));
                    }
                    warn!(
                        "Instruction service network error (attempt {}/{}): {}. Retrying in {:?}",
                        attempt, max_retries, e, backoff
                    );
                }
            }

            sleep(backoff).await;
            backoff *= 2;
        }
    }

    async fn chat(&self, system: &str, user: String) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ],
            "temperature": 0,
            "response_format": { "type": "json_object" }
        });
        let url = format!("{}/chat/completions", self.base_url);

        let res = self.post_with_retry(&url, &body).await?;
        if !res.status().is_success() {
            let error_text = res.text().await?;
            return Err(anyhow!("Chat Completion API Error: {}", error_text));
        }

        let res_json: Value = res.json().await?;
        if let Some(refusal) = res_json["choices"][0]["message"]["refusal"].as_str() {
            return Err(anyhow!("LLM refused: {}", refusal));
        }
        res_json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("No content in chat completion response"))
    }
}

pub fn build_step_prompt(instruction: &str, history: &[Action], elements: &[DetectedElement]) -> String {
    let previous: Vec<Value> = history.iter().map(Action::to_value).collect();
    let visible: Vec<Value> = elements.iter().map(DetectedElement::summary).collect();
    format!(
        "Screen elements: {}\nPrevious actions: {}\nInstruction: {}\nGive only the next single action.",
        Value::Array(visible),
        Value::Array(previous),
        instruction
    )
}

#[async_trait]
impl InstructionSource for HttpInstructionSource {
    async fn next_action(
        &self,
        instruction: &str,
        history: &[Action],
        elements: &[DetectedElement],
    ) -> Result<String> {
        self.chat(ACTION_SCHEMA_PROMPT, build_step_prompt(instruction, history, elements))
            .await
    }

    async fn plan_workflow(&self, instruction: &str) -> Result<String> {
        self.chat(WORKFLOW_PROMPT, format!("Goal: {}", instruction)).await
    }
}
