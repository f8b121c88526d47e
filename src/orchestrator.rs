use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};

use crate::action_schema::{parse_workflow_text, Action, ActionHistory};
use crate::config::EngineConfig;
use crate::controller::{
    CancelToken, Collaborators, LoopContext, StatusLine, StepLoop, StepOutcome, WorkflowReport, WorkflowRunner,
};
use crate::error::EngineError;
use crate::executor::{ActionExecutor, InputBackend};
use crate::llm_gateway::InstructionSource;
use crate::recorder::{ActionRecorder, EventSink, ReplayReport, Replayer, SystemClock};
use crate::session_store::HistoryStore;
use crate::vision_client::VisionParser;
use crate::visual_driver::Desktop;

/// Where a stored action list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredKind {
    History,
    Recording,
}

/// Releases the single device slot when a run ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the collaborators and stores, and runs one device task at a time.
pub struct Orchestrator {
    config: EngineConfig,
    desktop: Arc<dyn Desktop>,
    executor: ActionExecutor,
    vision: Arc<dyn VisionParser>,
    instructions: Arc<dyn InstructionSource>,
    histories: HistoryStore,
    recordings: HistoryStore,
    cancel: CancelToken,
    status: StatusLine,
    busy: AtomicBool,
    recorder: Mutex<Option<ActionRecorder>>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        desktop: Arc<dyn Desktop>,
        backend: Arc<dyn InputBackend>,
        vision: Arc<dyn VisionParser>,
        instructions: Arc<dyn InstructionSource>,
    ) -> Result<Self> {
        let histories = HistoryStore::new(&config.history_dir)?;
        let recordings = HistoryStore::new(&config.recordings_dir)?;
        Ok(Self {
            config,
            desktop,
            executor: ActionExecutor::new(backend),
            vision,
            instructions,
            histories,
            recordings,
            cancel: CancelToken::new(),
            status: StatusLine::new(),
            busy: AtomicBool::new(false),
            recorder: Mutex::new(None),
        })
    }

    pub fn status(&self) -> &StatusLine {
        &self.status
    }

    /// Asks the running task, if any, to stop at its next checkpoint.
    pub fn stop(&self) {
        info!("Stop requested");
        self.cancel.cancel();
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn claim(&self) -> Result<BusyGuard<'_>> {
        if self.busy.swap(true, Ordering::SeqCst) {
            bail!("Another task is still running; use 'stop' first");
        }
        self.cancel.reset();
        Ok(BusyGuard(&self.busy))
    }

    fn loop_context(&self) -> LoopContext<'_> {
        LoopContext {
            desktop: self.desktop.as_ref(),
            executor: &self.executor,
            cancel: &self.cancel,
            status: &self.status,
        }
    }

    fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            vision: self.vision.as_ref(),
            instructions: self.instructions.as_ref(),
        }
    }

    /// Primary mode. The history is saved under the instruction's name even
    /// when the loop fails part way.
    pub async fn run_instruction(&self, instruction: &str) -> Result<StepOutcome> {
        let _guard = self.claim()?;
        info!("Running instruction: {}", instruction);

        let mut history = ActionHistory::new();
        let mut step_loop = StepLoop::new(self.loop_context(), self.collaborators(), &self.config);
        let outcome = step_loop
            .run(instruction, &mut history, self.config.max_iterations)
            .await;

        self.persist_history(instruction, history.as_slice());
        Ok(outcome?)
    }

    /// Plans the whole task up front, then runs it with single-step recovery.
    pub async fn run_workflow(&self, instruction: &str) -> Result<WorkflowReport> {
        let _guard = self.claim()?;
        info!("Planning workflow: {}", instruction);
        self.status.set("Planning workflow");

        let plan = self
            .instructions
            .plan_workflow(instruction)
            .await
            .map_err(|e| EngineError::Collaborator(format!("instruction source: {}", e)))?;
        let steps = parse_workflow_text(&plan)?;
        info!("Workflow has {} step(s)", steps.len());

        let mut history = ActionHistory::new();
        let runner = WorkflowRunner::new(self.loop_context(), self.collaborators(), &self.config);
        let report = runner.run(instruction, &steps, &mut history).await;

        self.persist_history(instruction, history.as_slice());
        Ok(report)
    }

    /// Replays a stored history, falling back to recordings of the same name.
    pub async fn replay(&self, name: &str) -> Result<ReplayReport> {
        let _guard = self.claim()?;
        let (kind, actions) = self.show(name)?;
        if actions.is_empty() {
            bail!("Nothing to replay in '{}'", name);
        }
        info!("Replaying {:?} '{}' ({} action(s))", kind, name, actions.len());

        let mut replayer = Replayer::new(self.loop_context(), &self.config);
        Ok(replayer.replay(&actions).await?)
    }

    /// Loads a stored action list by name.
    pub fn show(&self, name: &str) -> Result<(StoredKind, Vec<Action>)> {
        if self.histories.exists(name) {
            return Ok((StoredKind::History, self.histories.load(name)?));
        }
        if self.recordings.exists(name) {
            return Ok((StoredKind::Recording, self.recordings.load(name)?));
        }
        Err(anyhow!("No history or recording named '{}'", name))
    }

    pub fn list_histories(&self) -> Result<Vec<String>> {
        self.histories.list()
    }

    pub fn list_recordings(&self) -> Result<Vec<String>> {
        self.recordings.list()
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.lock().map(|r| r.is_some()).unwrap_or(false)
    }

    /// Starts a recording session. The platform listener feeds the returned sink.
    pub fn start_recording(&self) -> Result<EventSink> {
        let mut slot = self.recorder.lock().map_err(|_| anyhow!("recorder lock poisoned"))?;
        if slot.is_some() {
            bail!("Already recording");
        }
        let (recorder, sink) = ActionRecorder::start(Arc::new(SystemClock));
        *slot = Some(recorder);
        self.status.set("Recording");
        Ok(sink)
    }

    /// Finalizes the recording and saves it under `name`.
    pub fn stop_recording(&self, name: &str) -> Result<(PathBuf, usize)> {
        let recorder = self
            .recorder
            .lock()
            .map_err(|_| anyhow!("recorder lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("Not recording"))?;

        let actions = recorder.stop();
        let path = self
            .recordings
            .save(name, &actions)
            .with_context(|| format!("Failed to save recording '{}'", name))?;
        self.status
            .set(format!("Recording saved: {} action(s) to {:?}", actions.len(), path));
        Ok((path, actions.len()))
    }

    /// Ends a recording without saving it.
    pub fn discard_recording(&self) {
        let recorder = self.recorder.lock().ok().and_then(|mut slot| slot.take());
        if let Some(recorder) = recorder {
            let dropped = recorder.stop().len();
            warn!("Discarded recording with {} action(s)", dropped);
        }
    }

    fn persist_history(&self, instruction: &str, actions: &[Action]) {
        match self.histories.save(instruction, actions) {
            Ok(path) => info!("Saved {} action(s) to {:?}", actions.len(), path),
            Err(e) => warn!("Failed to save history for '{}': {}", instruction, e),
        }
    }
}
