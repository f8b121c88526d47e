use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Backend execution error: {0}")]
    BackendExecution(String),

    #[error("Desktop did not change after {attempts} attempt(s)")]
    StabilizationTimeout { attempts: u32 },

    #[error("No baseline screenshot to compare against")]
    MissingBaseline,

    #[error("No valid JSON found in: {0}")]
    NoValidJson(String),

    #[error("Workflow aborted at step {step}: {reason}")]
    WorkflowStepAborted { step: usize, reason: String },

    #[error("Cancelled by operator")]
    Cancelled,

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),
}

impl EngineError {
    /// Errors that end only the current action; the surrounding loop keeps going.
    pub fn is_action_local(&self) -> bool {
        matches!(
            self,
            EngineError::SchemaViolation(_)
                | EngineError::InvalidTarget(_)
                | EngineError::BackendExecution(_)
                | EngineError::StabilizationTimeout { .. }
                | EngineError::MissingBaseline
        )
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
