//! The task state machine: the single mutation path for a `Task` record.
//!
//! Implemented as an actor over an mpsc command channel: a cloneable handle
//! sends commands with oneshot reply channels to a single task-owning loop,
//! which is itself the per-task serialization point (no explicit lock
//! needed since every mutation funnels through one loop).

mod handle;
mod messages;

pub use handle::{ProgressPatch, TaskPatch, TaskStateMachineHandle};
pub use messages::{StateMachineError, TaskCommand, TaskStateEvent};
