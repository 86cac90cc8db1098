use thiserror::Error;

/// Worker- and manager-level error taxonomy. `AgentError` (the per-stage
/// failure a concrete `AgentStage` returns) is kept separate since it
/// carries a recoverable/fatal classification the worker, not the agent,
/// acts on.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed submission; returned synchronously from `start_task`,
    /// never surfaced as task state.
    #[error("invalid task submission: {0}")]
    Validation(String),

    /// The stop latch was observed; used as an internal control-flow
    /// signal inside the worker's step loop.
    #[error("task was stopped")]
    Stopped,

    /// A state transition violated the task lifecycle invariant.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("task {0} is not registered")]
    UnknownTask(String),

    #[error(transparent)]
    StateMachine(#[from] crate::state_machine::StateMachineError),

    #[error(transparent)]
    Control(#[from] crate::control::ControlError),

    #[error(transparent)]
    Store(#[from] orchestrator_store::StoreError),
}

/// Returned by `AgentStage::run`. `recoverable` drives the worker's
/// per-node error policy: recoverable errors synthesize a fallback
/// placeholder and continue; fatal errors terminate the task as FAILED.
#[derive(Debug, Clone)]
pub struct AgentError {
    pub recoverable: bool,
    pub message: String,
}

impl AgentError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self { recoverable: false, message: message.into() }
    }

    pub fn recoverable(message: impl Into<String>) -> Self {
        Self { recoverable: true, message: message.into() }
    }
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (recoverable={})", self.message, self.recoverable)
    }
}

impl std::error::Error for AgentError {}
