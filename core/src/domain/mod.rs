//! Domain types for the orchestrator core.
//!
//! `Task` is the central record; `Step`/`StepHistoryEntry` describe the
//! generated pipeline plan and its execution ledger; `ProgressMessage`/
//! `StatusMessage` are the wire types carried on the message fabric.

mod message;
mod step;
mod task;

pub use message::{ProgressMessage, StatusMessage};
pub use step::{NodeStatus, Step, StepHistoryEntry, StepStatus};
pub use task::{AnalysisParams, CacheReuseConfig, MarketType, Progress, Task, TaskStatus};
