use log::{info, warn};
use serde_json::Value;

use super::{apply_action, Applied, Collaborators, LoopContext, StepLoop, StepOutcome};
use crate::action_schema::{validate_action, ActionHistory, Strictness};
use crate::config::EngineConfig;
use crate::coordinates::resolve_action;
use crate::error::{EngineError, EngineResult};
use crate::visual_verification::StabilizationMonitor;

/// Steps are numbered from 1 in every state.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowState {
    Running { step: usize },
    Recovering { step: usize },
    Completed,
    Aborted { step: usize, reason: String },
}

#[derive(Debug, Clone)]
pub struct WorkflowReport {
    /// Every state the runner passed through, ending in `Completed` or `Aborted`.
    pub transitions: Vec<WorkflowState>,
}

impl WorkflowReport {
    pub fn final_state(&self) -> Option<&WorkflowState> {
        self.transitions.last()
    }

    pub fn entered_recovery(&self) -> bool {
        self.transitions
            .iter()
            .any(|s| matches!(s, WorkflowState::Recovering { .. }))
    }

    pub fn into_result(self) -> EngineResult<()> {
        match self.transitions.into_iter().last() {
            Some(WorkflowState::Aborted { step, reason }) => Err(EngineError::WorkflowStepAborted { step, reason }),
            _ => Ok(()),
        }
    }
}

/// Executes a planned action list without re-detection, falling back to the
/// single-step loop when a step fails.
pub struct WorkflowRunner<'a> {
    ctx: LoopContext<'a>,
    collaborators: Collaborators<'a>,
    config: &'a EngineConfig,
    monitor: StabilizationMonitor,
    transitions: Vec<WorkflowState>,
}

impl<'a> WorkflowRunner<'a> {
    pub fn new(ctx: LoopContext<'a>, collaborators: Collaborators<'a>, config: &'a EngineConfig) -> Self {
        Self {
            ctx,
            collaborators,
            config,
            monitor: StabilizationMonitor::new(config.thresholds, config.stabilization),
            transitions: Vec::new(),
        }
    }

    pub async fn run(mut self, instruction: &str, steps: &[Value], history: &mut ActionHistory) -> WorkflowReport {
        let total = steps.len();

        for (index, raw) in steps.iter().enumerate() {
            let step = index + 1;

            if index > 0 {
                if let Err(e) = self.ctx.cancel.sleep(self.config.step_pause).await {
                    return self.abort(step, e.to_string());
                }
            }
            if self.ctx.cancel.is_cancelled() {
                return self.abort(step, EngineError::Cancelled.to_string());
            }

            self.enter(WorkflowState::Running { step });
            self.ctx.status.set(format!("Step {}/{}", step, total));

            match self.run_step(raw, history).await {
                Ok(true) => {}
                Ok(false) => {
                    info!("Workflow finished early at step {}", step);
                    break;
                }
                Err(EngineError::Cancelled) => return self.abort(step, EngineError::Cancelled.to_string()),
                Err(e) => {
                    warn!("Workflow step {} failed: {}", step, e);
                    if let Err(reason) = self.recover(instruction, raw, history, step).await {
                        return self.abort(step, reason);
                    }
                }
            }
        }

        self.enter(WorkflowState::Completed);
        self.ctx
            .status
            .set(format!("Workflow completed with {} action(s)", history.len()));
        WorkflowReport {
            transitions: self.transitions,
        }
    }

    /// `Ok(false)` means the step was `finish`.
    async fn run_step(&mut self, raw: &Value, history: &mut ActionHistory) -> EngineResult<bool> {
        let action = validate_action(raw, Strictness::Strict)?;
        let screen = self
            .ctx
            .desktop
            .screen_size()
            .map_err(|e| EngineError::Capture(e.to_string()))?;
        let resolved = resolve_action(&action, None, screen)?;

        if resolved.action.needs_stabilization() {
            self.monitor.capture_baseline(self.ctx.desktop)?;
        }

        match apply_action(&self.ctx, &mut self.monitor, &resolved).await? {
            Applied::Finished => Ok(false),
            Applied::Done(done) => {
                history.push(done);
                Ok(true)
            }
        }
    }

    async fn recover(
        &mut self,
        instruction: &str,
        failed: &Value,
        history: &mut ActionHistory,
        step: usize,
    ) -> Result<(), String> {
        self.enter(WorkflowState::Recovering { step });
        self.ctx.status.set(format!("Step {} failed, recovering", step));

        let annotated = format!("{} (the action that failed was: {})", instruction, failed);
        let mut step_loop = StepLoop::new(self.ctx, self.collaborators, self.config);
        match step_loop
            .recover(&annotated, history, self.config.recovery_iterations)
            .await
        {
            Ok(StepOutcome::Executed(action)) => {
                info!("Recovered step {} with {} on '{}'", step, action.action, action.target);
                Ok(())
            }
            Ok(StepOutcome::Finished) => {
                info!("Recovery reports the goal is already reached at step {}", step);
                Ok(())
            }
            Ok(StepOutcome::Exhausted) => Err(format!(
                "recovery produced no successful action in {} attempt(s)",
                self.config.recovery_iterations
            )),
            Err(e) => Err(e.to_string()),
        }
    }

    fn enter(&mut self, state: WorkflowState) {
        self.transitions.push(state);
    }

    fn abort(mut self, step: usize, reason: String) -> WorkflowReport {
        self.ctx
            .status
            .set(format!("Workflow aborted at step {}: {}", step, reason));
        self.enter(WorkflowState::Aborted { step, reason });
        WorkflowReport {
            transitions: self.transitions,
        }
    }
}
