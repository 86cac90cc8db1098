//! Durable key-value storage for task current-state and per-task history lists.
//!
//! Two kinds of records are persisted per task: a *current state* document
//! (overwritten on every save) and an append-only *history* list. Two
//! backends implement [`StateStore`]: [`LocalFileStore`] (one JSON document
//! per task plus one JSON array file for history) and [`RemoteKvStore`]
//! (a single key for current state, a right-pushed list for history, over
//! an abstract [`KvClient`]). [`FallbackStore`] composes the two so a
//! configured remote backend that fails to connect falls back to the local
//! backend for the process lifetime.

mod error;
mod local_file;
mod remote_kv;

pub use error::StoreError;
pub use local_file::LocalFileStore;
pub use remote_kv::{FallbackStore, InMemoryKvClient, KvClient, LocalFileStoreFactory, RemoteKvStore};

use async_trait::async_trait;
use serde_json::Value;

/// Which concrete backend a [`StateStore`] is using, for logging/diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    LocalFile,
    RemoteKv,
    /// A `FallbackStore` that fell back to the local backend.
    RemoteKvFallenBack,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::LocalFile => write!(f, "local-file"),
            StoreKind::RemoteKv => write!(f, "remote-kv"),
            StoreKind::RemoteKvFallenBack => write!(f, "remote-kv (fell back to local-file)"),
        }
    }
}

/// Durable storage for a task's current state and history.
///
/// Implementations must be safe to call concurrently from multiple tasks;
/// per-task write ordering is the caller's responsibility (the core crate's
/// task state machine actor owns that serialization).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Idempotent write of the current-state document; overwrites.
    async fn save_current(&self, task_id: &str, state: &Value) -> Result<(), StoreError>;

    /// Load the current-state document, or `None` if the task is unknown.
    async fn load_current(&self, task_id: &str) -> Result<Option<Value>, StoreError>;

    /// Append a document to the task's history list.
    async fn append_history(&self, task_id: &str, state: &Value) -> Result<(), StoreError>;

    /// Load the full ordered history list (possibly empty).
    async fn load_history(&self, task_id: &str) -> Result<Vec<Value>, StoreError>;

    /// List the task ids known to this store (used by the result-reuse
    /// cache to build its secondary index, and by restart recovery).
    async fn list_task_ids(&self) -> Result<Vec<String>, StoreError>;

    fn kind(&self) -> StoreKind;
}
