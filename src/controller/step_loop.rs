use std::time::Duration;

use log::{info, warn};

use super::{apply_action, Applied, Collaborators, LoopContext};
use crate::action_schema::{parse_action_text, Action, ActionHistory};
use crate::config::EngineConfig;
use crate::coordinates::resolve_action;
use crate::error::{EngineError, EngineResult};
use crate::visual_verification::StabilizationMonitor;

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The instruction source said the goal is reached.
    Finished,
    /// One action ran and its effect was observed (recovery mode only).
    Executed(Action),
    /// The iteration budget ran out first.
    Exhausted,
}

enum Iteration {
    Finished,
    Succeeded(Action),
}

/// The observe, ask, act, verify loop that re-detects the screen and asks the
/// instruction source for one action at a time.
pub struct StepLoop<'a> {
    ctx: LoopContext<'a>,
    collaborators: Collaborators<'a>,
    monitor: StabilizationMonitor,
    settle_delay: Duration,
}

impl<'a> StepLoop<'a> {
    pub fn new(ctx: LoopContext<'a>, collaborators: Collaborators<'a>, config: &EngineConfig) -> Self {
        Self {
            ctx,
            collaborators,
            monitor: StabilizationMonitor::new(config.thresholds, config.stabilization),
            settle_delay: config.settle_delay,
        }
    }

    /// Primary mode: keeps going until `finish`, cancellation, or
    /// `max_iterations` iterations. Successful actions land in `history` as
    /// they happen, so it stays valid when this returns an error.
    pub async fn run(
        &mut self,
        instruction: &str,
        history: &mut ActionHistory,
        max_iterations: u32,
    ) -> EngineResult<StepOutcome> {
        for iteration in 1..=max_iterations {
            match self.guarded_iteration(instruction, history, iteration).await? {
                Some(Iteration::Finished) => {
                    self.ctx.status.set(format!("Done after {} action(s)", history.len()));
                    return Ok(StepOutcome::Finished);
                }
                Some(Iteration::Succeeded(_)) | None => {}
            }
        }
        self.ctx
            .status
            .set(format!("Stopped after {} iteration(s) without finishing", max_iterations));
        Ok(StepOutcome::Exhausted)
    }

    /// Recovery mode: stops at the first action whose effect was observed.
    pub async fn recover(
        &mut self,
        instruction: &str,
        history: &mut ActionHistory,
        max_iterations: u32,
    ) -> EngineResult<StepOutcome> {
        for iteration in 1..=max_iterations {
            match self.guarded_iteration(instruction, history, iteration).await? {
                Some(Iteration::Finished) => return Ok(StepOutcome::Finished),
                Some(Iteration::Succeeded(action)) => return Ok(StepOutcome::Executed(action)),
                None => {}
            }
        }
        Ok(StepOutcome::Exhausted)
    }

    /// Runs one iteration, turning errors that only spoil this attempt into
    /// `None` so the caller repeats it without touching the history.
    async fn guarded_iteration(
        &mut self,
        instruction: &str,
        history: &mut ActionHistory,
        iteration: u32,
    ) -> EngineResult<Option<Iteration>> {
        match self.iterate(instruction, history).await {
            Ok(step) => Ok(Some(step)),
            Err(e) if e.is_action_local() => {
                warn!("Iteration {} discarded: {}", iteration, e);
                self.ctx.status.set(format!("Retrying: {}", e));
                Ok(None)
            }
            Err(e) => {
                self.ctx.status.set(format!("Stopped: {}", e));
                Err(e)
            }
        }
    }

    async fn iterate(&mut self, instruction: &str, history: &mut ActionHistory) -> EngineResult<Iteration> {
        let ctx = self.ctx;
        ctx.cancel.check()?;

        ctx.status.set("Capturing desktop");
        self.monitor.capture_baseline(ctx.desktop)?;
        ctx.cancel.sleep(self.settle_delay).await?;

        let screenshot = ctx
            .desktop
            .capture()
            .map_err(|e| EngineError::Capture(e.to_string()))?;
        let screen = ctx
            .desktop
            .screen_size()
            .map_err(|e| EngineError::Capture(e.to_string()))?;

        ctx.status.set("Detecting screen elements");
        let elements = self
            .collaborators
            .vision
            .parse(&screenshot)
            .await
            .map_err(|e| EngineError::Collaborator(format!("vision: {}", e)))?;

        ctx.status.set("Asking for the next action");
        let reply = self
            .collaborators
            .instructions
            .next_action(instruction, history.as_slice(), &elements)
            .await
            .map_err(|e| EngineError::Collaborator(format!("instruction source: {}", e)))?;

        let action = parse_action_text(&reply)?;
        info!("Next action: {} on '{}' (id {})", action.action, action.target, action.id);
        let resolved = resolve_action(&action, Some(&elements), screen)?;

        match apply_action(&ctx, &mut self.monitor, &resolved).await? {
            Applied::Finished => Ok(Iteration::Finished),
            Applied::Done(done) => {
                history.push(done.clone());
                Ok(Iteration::Succeeded(done))
            }
        }
    }
}
