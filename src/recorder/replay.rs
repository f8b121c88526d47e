use std::time::Duration;

use log::{info, warn};

use crate::action_schema::{Action, ActionKind};
use crate::config::EngineConfig;
use crate::controller::{apply_action, Applied, LoopContext};
use crate::coordinates::{resolve_action, ScreenSize};
use crate::error::{EngineError, EngineResult};
use crate::visual_verification::StabilizationMonitor;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub executed: usize,
    pub failed: usize,
    /// A `finish` action was reached.
    pub finished: bool,
}

/// Plays a stored action list back without element detection. Recorded
/// `delay` actions reproduce the original pacing.
pub struct Replayer<'a> {
    ctx: LoopContext<'a>,
    monitor: StabilizationMonitor,
    pause: Duration,
}

impl<'a> Replayer<'a> {
    pub fn new(ctx: LoopContext<'a>, config: &EngineConfig) -> Self {
        Self {
            ctx,
            monitor: StabilizationMonitor::new(config.thresholds, config.stabilization),
            pause: config.replay_pause,
        }
    }

    /// A failing action is logged and skipped; only cancellation and capture
    /// trouble stop the replay.
    pub async fn replay(&mut self, actions: &[Action]) -> EngineResult<ReplayReport> {
        let mut report = ReplayReport::default();
        let screen = self
            .ctx
            .desktop
            .screen_size()
            .map_err(|e| EngineError::Capture(e.to_string()))?;

        let mut previous: Option<ActionKind> = None;
        for (index, action) in actions.iter().enumerate() {
            self.ctx.cancel.check()?;
            if matches!(previous, Some(kind) if kind != ActionKind::Delay) {
                self.ctx.cancel.sleep(self.pause).await?;
            }
            previous = Some(action.action);

            self.ctx
                .status
                .set(format!("Replaying {}/{}: {}", index + 1, actions.len(), action.target));

            match self.replay_one(action, screen).await {
                Ok(Applied::Finished) => {
                    report.finished = true;
                    break;
                }
                Ok(Applied::Done(_)) => report.executed += 1,
                Err(e) if e.is_action_local() => {
                    warn!("Replay of action {} ({}) failed: {}", index + 1, action.action, e);
                    report.failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Replay done: {} executed, {} failed",
            report.executed, report.failed
        );
        self.ctx.status.set(format!(
            "Replay finished: {} executed, {} failed",
            report.executed, report.failed
        ));
        Ok(report)
    }

    async fn replay_one(&mut self, action: &Action, screen: ScreenSize) -> EngineResult<Applied> {
        let resolved = resolve_action(action, None, screen)?;
        if resolved.action.needs_stabilization() {
            self.monitor.capture_baseline(self.ctx.desktop)?;
        }
        apply_action(&self.ctx, &mut self.monitor, &resolved).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_schema::{validate_action, Strictness};
    use crate::controller::{CancelToken, StatusLine};
    use crate::executor::ActionExecutor;
    use crate::test_support::{fast_config, BackendCall, RecordingBackend, ScriptedDesktop};
    use serde_json::json;
    use std::sync::Arc;

    fn recorded() -> Vec<Action> {
        [
            json!({"action": "click", "id": -1, "target": "click at (5, 6)", "params": {"x": 5, "y": 6}}),
            json!({"action": "delay", "id": -1, "target": "wait", "params": {"seconds": 0.0}}),
            json!({"action": "hotkey", "id": -1, "target": "hotkey cmd+w", "params": {"key_sequence": ["cmd", "w"]}}),
            json!({"action": "click", "id": 3, "target": "stale element"}),
            json!({"action": "finish", "id": -1, "target": "finish"}),
            json!({"action": "press_enter", "id": -1, "target": "after finish"}),
        ]
        .iter()
        .map(|v| validate_action(v, Strictness::Lenient).unwrap())
        .collect()
    }

    #[tokio::test]
    async fn replays_until_finish_and_skips_unresolvable() {
        let desktop = ScriptedDesktop::changing(100, 100);
        let backend = Arc::new(RecordingBackend::default());
        let executor = ActionExecutor::new(backend.clone());
        let cancel = CancelToken::new();
        let status = StatusLine::new();
        let ctx = LoopContext {
            desktop: &desktop,
            executor: &executor,
            cancel: &cancel,
            status: &status,
        };

        let report = Replayer::new(ctx, &fast_config()).replay(&recorded()).await.unwrap();

        assert_eq!(
            report,
            ReplayReport {
                executed: 3,
                failed: 1,
                finished: true
            }
        );
        assert_eq!(
            backend.calls(),
            vec![
                BackendCall::Click(Some((5, 6)), Default::default(), 1),
                BackendCall::Hotkey(vec!["cmd".into(), "w".into()]),
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_replay_stops() {
        let desktop = ScriptedDesktop::changing(100, 100);
        let backend = Arc::new(RecordingBackend::default());
        let executor = ActionExecutor::new(backend.clone());
        let cancel = CancelToken::new();
        cancel.cancel();
        let status = StatusLine::new();
        let ctx = LoopContext {
            desktop: &desktop,
            executor: &executor,
            cancel: &cancel,
            status: &status,
        };

        let err = Replayer::new(ctx, &fast_config()).replay(&recorded()).await.unwrap_err();

        assert!(matches!(err, EngineError::Cancelled));
        assert!(backend.calls().is_empty());
    }
}
