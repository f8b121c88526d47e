//! Control loops that drive actions against the desktop, plus the shared
//! cancellation and status plumbing they report through.

pub mod step_loop;
pub mod workflow;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::sync::{watch, Notify};

use crate::action_schema::{Action, ActionKind};
use crate::error::{EngineError, EngineResult};
use crate::executor::{ActionExecutor, ExecutionOutcome};
use crate::llm_gateway::InstructionSource;
use crate::vision_client::VisionParser;
use crate::visual_driver::{Desktop, WindowWatch};
use crate::visual_verification::StabilizationMonitor;

pub use step_loop::{StepLoop, StepOutcome};
pub use workflow::{WorkflowReport, WorkflowRunner, WorkflowState};

/// Device-side handles every loop drives actions through.
#[derive(Clone, Copy)]
pub struct LoopContext<'a> {
    pub desktop: &'a dyn Desktop,
    pub executor: &'a ActionExecutor,
    pub cancel: &'a CancelToken,
    pub status: &'a StatusLine,
}

/// Remote services the AI-driven loops consult.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub vision: &'a dyn VisionParser,
    pub instructions: &'a dyn InstructionSource,
}

pub(crate) enum Applied {
    Finished,
    Done(Action),
}

/// Executes an already resolved action and waits for its visible effect.
/// New windows it opened are maximized.
pub(crate) async fn apply_action(
    ctx: &LoopContext<'_>,
    monitor: &mut StabilizationMonitor,
    action: &Action,
) -> EngineResult<Applied> {
    if action.action == ActionKind::Finish {
        return Ok(Applied::Finished);
    }

    let watch = WindowWatch::start(ctx.desktop);
    ctx.status.set(format!("Executing {} on '{}'", action.action, action.target));
    let result = match ctx.executor.execute(action, ctx.cancel).await {
        ExecutionOutcome::Finished => return Ok(Applied::Finished),
        ExecutionOutcome::Executed(result) => result,
    };

    if !result.is_success() {
        ctx.cancel.check()?;
        return Err(EngineError::BackendExecution(result.status.to_string()));
    }

    if action.action.needs_stabilization() {
        ctx.status.set(format!("Waiting for the desktop to react to {}", action.action));
    }
    monitor.confirm_change(action.action, ctx.desktop, ctx.cancel).await?;
    watch.focus_new_window(ctx.desktop);
    Ok(Applied::Done(result.action))
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

/// Cooperative stop signal. Loops check it between steps and every wait
/// goes through [`CancelToken::sleep`] so a stop request cuts it short.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn reset(&self) {
        self.inner.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> EngineResult<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub async fn sleep(&self, duration: Duration) -> EngineResult<()> {
        if duration.is_zero() {
            return self.check();
        }

        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // register before checking the flag so a concurrent cancel is not lost
        notified.as_mut().enable();
        self.check()?;

        tokio::select! {
            _ = tokio::time::sleep(duration) => self.check(),
            _ = notified => Err(EngineError::Cancelled),
        }
    }
}

/// Latest human-readable progress message. Writers overwrite, readers see
/// only the newest value.
#[derive(Clone)]
pub struct StatusLine {
    tx: Arc<watch::Sender<String>>,
}

impl Default for StatusLine {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusLine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(String::new());
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.tx.send_replace(message);
    }

    pub fn current(&self) -> String {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.tx.subscribe()
    }
}
