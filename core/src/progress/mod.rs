//! Step planning and progress computation.
//!
//! `step_plan::plan` is a pure function (no I/O, no globals) producing the
//! ordered step list and the `module_name -> step_index` table. `tracker`
//! owns per-task progress state and talks to the state machine and message
//! fabric.

pub mod step_plan;
mod tracker;

pub use step_plan::{StepPlan, duration_estimate_seconds};
pub use tracker::ProgressTracker;
