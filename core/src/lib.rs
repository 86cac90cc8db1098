//! Multi-agent analysis task execution engine.
//!
//! Orchestrates a fixed pipeline of analysis stages per submitted task:
//! generates the step list, runs a worker through it stage by stage,
//! persists every transition through a single-writer state machine, and
//! exposes a cooperative pause/resume/stop control protocol. Agent
//! implementations, the HTTP surface, report formatting, data-source
//! adapters, and concrete LLM providers are out of scope here; the
//! [`pipeline::AgentStage`] trait is the seam where they attach.
//!
//! # Modules
//!
//! - [`domain`] - core records: `Task`, `Step`, wire message types
//! - [`state_machine`] - single-writer actor mutating a `Task`
//! - [`progress`] - step-list generation and progress tracking
//! - [`control`] - pause/resume/stop primitives and checkpointing
//! - [`cache`] - result-reuse lookup and splicing
//! - [`fabric`] - pub/sub dissemination of progress and status
//! - [`pipeline`] - the worker loop and task manager
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod cache;
pub mod cli;
pub mod config;
pub mod control;
pub mod domain;
pub mod fabric;
pub mod pipeline;
pub mod progress;
pub mod state_machine;

pub use cache::{CacheEntry, CacheLookupFilters, ResultReuseCache};
pub use config::Config;
pub use control::{ControlError, ControlHandle, ControlManager};
pub use domain::{AnalysisParams, CacheReuseConfig, MarketType, NodeStatus, Progress, Step, StepHistoryEntry, StepStatus, Task, TaskStatus};
pub use fabric::{DisabledFabric, FabricMessage, InMemoryFabric, MessageFabric};
pub use pipeline::{AgentError, AgentStage, PipelineError, StageContext, TaskManager, TaskManagerConfig};
pub use progress::{ProgressTracker, StepPlan};
pub use state_machine::{StateMachineError, TaskPatch, TaskStateMachineHandle};
