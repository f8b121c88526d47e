//! Scripted stand-ins for the desktop, input devices and remote services.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};

use crate::action_schema::{Action, MouseButton, ScrollDirection};
use crate::config::EngineConfig;
use crate::coordinates::{DetectedElement, ScreenSize};
use crate::executor::{InputBackend, Point};
use crate::llm_gateway::InstructionSource;
use crate::recorder::Clock;
use crate::vision_client::VisionParser;
use crate::visual_driver::Desktop;
use crate::visual_verification::RetryPolicy;

/// Default config with every wait set to zero.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        settle_delay: Duration::ZERO,
        stabilization: RetryPolicy {
            max_attempts: 4,
            interval: Duration::ZERO,
        },
        step_pause: Duration::ZERO,
        replay_pause: Duration::ZERO,
        ..EngineConfig::default()
    }
}

pub fn solid(width: u32, height: u32, luma: u8) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([luma, luma, luma])))
}

pub fn elements(n: usize) -> Vec<DetectedElement> {
    (0..n)
        .map(|i| DetectedElement {
            id: i as i64,
            kind: "icon".to_string(),
            content: format!("element {}", i),
            bbox: [0.0, 0.0, 0.5, 0.5],
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Move(i32, i32),
    Click(Option<Point>, MouseButton, u32),
    DoubleClick(Option<Point>, MouseButton),
    Scroll(ScrollDirection, Option<Point>),
    Type(String),
    Hotkey(Vec<String>),
    Enter,
}

#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<BackendCall>>,
    fail_with: Option<String>,
}

impl RecordingBackend {
    pub fn failing(message: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_with: Some(message.to_string()),
        }
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: BackendCall) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        match &self.fail_with {
            Some(message) => Err(anyhow!("{}", message)),
            None => Ok(()),
        }
    }
}

impl InputBackend for RecordingBackend {
    fn move_to(&self, x: i32, y: i32) -> Result<()> {
        self.record(BackendCall::Move(x, y))
    }

    fn click(&self, at: Option<Point>, button: MouseButton, clicks: u32) -> Result<()> {
        self.record(BackendCall::Click(at, button, clicks))
    }

    fn double_click(&self, at: Option<Point>, button: MouseButton) -> Result<()> {
        self.record(BackendCall::DoubleClick(at, button))
    }

    fn scroll(&self, direction: ScrollDirection, at: Option<Point>) -> Result<()> {
        self.record(BackendCall::Scroll(direction, at))
    }

    fn type_text(&self, text: &str) -> Result<()> {
        self.record(BackendCall::Type(text.to_string()))
    }

    fn hotkey(&self, keys: &[String]) -> Result<()> {
        self.record(BackendCall::Hotkey(keys.to_vec()))
    }

    fn press_enter(&self) -> Result<()> {
        self.record(BackendCall::Enter)
    }
}

/// Desktop that serves queued frames, then either a fixed frame or, when
/// `changing`, alternating black and white frames so every action "works".
pub struct ScriptedDesktop {
    size: ScreenSize,
    frames: Mutex<VecDeque<DynamicImage>>,
    default_frame: Mutex<DynamicImage>,
    changing: bool,
    toggle: AtomicBool,
    titles: Mutex<VecDeque<Vec<String>>>,
    last_titles: Mutex<Vec<String>>,
    maximized: Mutex<Vec<String>>,
    captures: AtomicUsize,
}

impl ScriptedDesktop {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: ScreenSize::new(width, height),
            frames: Mutex::new(VecDeque::new()),
            default_frame: Mutex::new(solid(width.min(64), height.min(64), 0)),
            changing: false,
            toggle: AtomicBool::new(false),
            titles: Mutex::new(VecDeque::new()),
            last_titles: Mutex::new(Vec::new()),
            maximized: Mutex::new(Vec::new()),
            captures: AtomicUsize::new(0),
        }
    }

    pub fn changing(width: u32, height: u32) -> Self {
        Self {
            changing: true,
            ..Self::new(width, height)
        }
    }

    pub fn push_frame(&self, frame: DynamicImage) {
        self.frames.lock().unwrap().push_back(frame);
    }

    pub fn set_default_frame(&self, frame: DynamicImage) {
        *self.default_frame.lock().unwrap() = frame;
    }

    pub fn push_titles(&self, titles: Vec<String>) {
        self.titles.lock().unwrap().push_back(titles);
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn maximized(&self) -> Vec<String> {
        self.maximized.lock().unwrap().clone()
    }
}

impl Desktop for ScriptedDesktop {
    fn capture(&self) -> Result<DynamicImage> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if let Some(frame) = self.frames.lock().unwrap().pop_front() {
            return Ok(frame);
        }
        if self.changing {
            let was_dark = self.toggle.fetch_xor(true, Ordering::SeqCst);
            let luma = if was_dark { 0 } else { 255 };
            return Ok(solid(32, 32, luma));
        }
        Ok(self.default_frame.lock().unwrap().clone())
    }

    fn screen_size(&self) -> Result<ScreenSize> {
        Ok(self.size)
    }

    fn window_titles(&self) -> Result<Vec<String>> {
        let mut last = self.last_titles.lock().unwrap();
        if let Some(next) = self.titles.lock().unwrap().pop_front() {
            *last = next;
        }
        Ok(last.clone())
    }

    fn maximize_window(&self, title: &str) -> Result<()> {
        self.maximized.lock().unwrap().push(title.to_string());
        Ok(())
    }
}

pub struct ScriptedVision {
    elements: Vec<DetectedElement>,
    fail: bool,
    calls: AtomicUsize,
}

impl ScriptedVision {
    pub fn new(elements: Vec<DetectedElement>) -> Self {
        Self {
            elements,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            elements: Vec::new(),
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionParser for ScriptedVision {
    async fn parse(&self, _screenshot: &DynamicImage) -> Result<Vec<DetectedElement>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("vision service unavailable"));
        }
        Ok(self.elements.clone())
    }
}

/// Replies from a queue; once empty every request gets `finish`.
#[derive(Default)]
pub struct ScriptedInstructions {
    replies: Mutex<VecDeque<String>>,
    plan: Mutex<Option<String>>,
    history_lengths: Mutex<Vec<usize>>,
}

impl ScriptedInstructions {
    pub fn with_replies(replies: &[&str]) -> Self {
        let source = Self::default();
        source
            .replies
            .lock()
            .unwrap()
            .extend(replies.iter().map(|r| r.to_string()));
        source
    }

    pub fn set_plan(&self, plan: &str) {
        *self.plan.lock().unwrap() = Some(plan.to_string());
    }

    /// History length seen by each `next_action` call.
    pub fn history_lengths(&self) -> Vec<usize> {
        self.history_lengths.lock().unwrap().clone()
    }
}

#[async_trait]
impl InstructionSource for ScriptedInstructions {
    async fn next_action(
        &self,
        _instruction: &str,
        history: &[Action],
        _elements: &[DetectedElement],
    ) -> Result<String> {
        self.history_lengths.lock().unwrap().push(history.len());
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| r#"{"action": "finish", "id": -1, "target": "done"}"#.to_string()))
    }

    async fn plan_workflow(&self, _instruction: &str) -> Result<String> {
        self.plan
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("no plan scripted"))
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }
}
