use thiserror::Error;

/// Errors from state store operations. A failed write or read here is
/// logged and handled by the caller (the task state machine), never
/// propagated to the control plane.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record for task {task_id}: {reason}")]
    Corrupt { task_id: String, reason: String },
}
