use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::Utc;
use log::{info, warn};
use serde_json::json;

use crate::action_schema::{Action, ActionKind, MouseButton, ScrollDirection};
use crate::controller::CancelToken;

/// Screen point in pixels.
pub type Point = (i32, i32);

/// Low-level input primitives. Each call is one OS-level gesture; `None`
/// positions act wherever the cursor or focus currently is.
pub trait InputBackend: Send + Sync {
    fn move_to(&self, x: i32, y: i32) -> Result<()>;

    fn click(&self, at: Option<Point>, button: MouseButton, clicks: u32) -> Result<()>;

    fn double_click(&self, at: Option<Point>, button: MouseButton) -> Result<()>;

    fn scroll(&self, direction: ScrollDirection, at: Option<Point>) -> Result<()>;

    fn type_text(&self, text: &str) -> Result<()>;

    fn hotkey(&self, keys: &[String]) -> Result<()>;

    fn press_enter(&self) -> Result<()>;

    /// Empties the focused text field.
    fn clear_field(&self) -> Result<()> {
        self.hotkey(&["ctrl".to_string(), "a".to_string()])?;
        self.hotkey(&["delete".to_string()])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionStatus {
    Success,
    Failed(String),
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::Failed(msg) => write!(f, "failed: {}", msg),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub action: Action,
    pub duration: Duration,
    pub status: ExecutionStatus,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// One structured line per executed action.
    pub fn log_line(&self) -> serde_json::Value {
        json!({
            "timestamp": Utc::now().to_rfc3339(),
            "action": self.action.action.as_str(),
            "target": self.action.target,
            "params": self.action.params,
            "duration": round2(self.duration.as_secs_f64()),
            "status": self.status.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// `finish` was requested; nothing was sent to the backend.
    Finished,
    Executed(ExecutionResult),
}

pub fn log_operation(result: &ExecutionResult) {
    let line = result.log_line();
    if result.is_success() {
        info!("{}", line);
    } else {
        warn!("{}", line);
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn to_pixels((x, y): (f64, f64)) -> Point {
    (x.round() as i32, y.round() as i32)
}

/// Turns resolved actions into backend calls.
pub struct ActionExecutor {
    backend: Arc<dyn InputBackend>,
}

impl ActionExecutor {
    pub fn new(backend: Arc<dyn InputBackend>) -> Self {
        Self { backend }
    }

    /// Runs one action. Backend failures come back as a failed status, never
    /// as an error.
    pub async fn execute(&self, action: &Action, cancel: &CancelToken) -> ExecutionOutcome {
        if action.action == ActionKind::Finish {
            info!("Finish requested: {}", action.target);
            return ExecutionOutcome::Finished;
        }

        let started = Instant::now();
        let status = match action.action {
            ActionKind::Delay => {
                let seconds = action.params.seconds.unwrap_or(0.0).max(0.0);
                match Duration::try_from_secs_f64(seconds) {
                    Ok(wait) => match cancel.sleep(wait).await {
                        Ok(()) => ExecutionStatus::Success,
                        Err(e) => ExecutionStatus::Failed(e.to_string()),
                    },
                    Err(e) => ExecutionStatus::Failed(format!("invalid delay of {} seconds: {}", seconds, e)),
                }
            }
            _ => match self.dispatch(action) {
                Ok(()) => ExecutionStatus::Success,
                Err(e) => ExecutionStatus::Failed(e.to_string()),
            },
        };

        let result = ExecutionResult {
            action: action.clone(),
            duration: started.elapsed(),
            status,
        };
        log_operation(&result);
        ExecutionOutcome::Executed(result)
    }

    fn dispatch(&self, action: &Action) -> Result<()> {
        let params = &action.params;
        let at = params.point().map(to_pixels);
        let button = params.button_type.unwrap_or_default();

        match action.action {
            ActionKind::Click => self.backend.click(at, button, params.clicks.unwrap_or(1)),
            ActionKind::Open => self.backend.double_click(at, button),
            ActionKind::Scroll => self.backend.scroll(params.direction.unwrap_or_default(), at),
            ActionKind::Input => {
                // only clear a field we explicitly focused ourselves
                if let Some(point) = at {
                    self.backend.click(Some(point), MouseButton::Left, 1)?;
                    self.backend.clear_field()?;
                }
                self.backend
                    .type_text(params.text_content.as_deref().unwrap_or_default())?;
                self.backend.press_enter()
            }
            ActionKind::Hotkey => match params.key_sequence.as_deref() {
                Some(keys) if !keys.is_empty() => self.backend.hotkey(keys),
                _ => Err(anyhow!("hotkey without keys")),
            },
            ActionKind::PressEnter => self.backend.press_enter(),
            ActionKind::Move => {
                let (x, y) = at.ok_or_else(|| anyhow!("move without coordinates"))?;
                self.backend.move_to(x, y)
            }
            ActionKind::Delay | ActionKind::Finish => Ok(()),
        }
    }
}
