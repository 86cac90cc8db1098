use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{AnalysisParams, Task};

#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("task {0} already exists")]
    AlreadyExists(String),

    #[error("task {0} not found")]
    NotFound(String),

    #[error("invariant violation for task {task_id}: {reason}")]
    InvariantViolation { task_id: String, reason: String },

    #[error(transparent)]
    Store(#[from] orchestrator_store::StoreError),
}

/// Commands accepted by the task state machine actor loop, one instance per
/// task. Each carries a oneshot reply channel, mirroring the reference
/// codebase's daemon-level command actor.
#[derive(Debug)]
pub enum TaskCommand {
    Initialize {
        params: AnalysisParams,
        reply: oneshot::Sender<Result<Task, StateMachineError>>,
    },
    UpdateState {
        updates: Value,
        reply: oneshot::Sender<Result<Task, StateMachineError>>,
    },
    GetCurrent {
        reply: oneshot::Sender<Option<Task>>,
    },
    GetHistory {
        reply: oneshot::Sender<Vec<Task>>,
    },
    Shutdown,
}

/// Broadcast on every successful mutation so co-located components
/// (`ProgressTracker`, diagnostics) observe transitions without polling.
#[derive(Debug, Clone)]
pub enum TaskStateEvent {
    Initialized(Box<Task>),
    Updated(Box<Task>),
}
