//! Planned pipeline step and step-execution ledger entries.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Error,
    Paused,
}

/// Node-level status carried on a `ProgressTracker::update_from_message`
/// payload; distinct from `StepStatus` (the planned-step's own lifecycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Start,
    ToolCalling,
    Paused,
    Complete,
    Error,
}

/// One planned pipeline stage. `weight` is this step's share of the total
/// task, in `(0, 1]`; weights across the whole generated plan sum to 1.0
/// (renormalized by `progress::step_plan::plan`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_index: usize,
    pub name: String,
    pub description: String,
    pub weight: f64,
    pub phase: String,
    pub status: StepStatus,
    #[serde(default)]
    pub round: Option<u32>,
    #[serde(default)]
    pub role: Option<String>,
    /// Stable node identifier correlated against `cache_reuse_config` and
    /// `ProgressMessage::module_name`; `None` for phase-marker steps that
    /// have no single corresponding agent node.
    #[serde(default)]
    pub module_name: Option<String>,
}

/// Records one completed or active step execution. Appended when a new step
/// opens (closing the previous entry) or when a terminal `node_status`
/// arrives for the currently open step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepHistoryEntry {
    pub step_index: usize,
    pub step_name: String,
    pub start_time: f64,
    #[serde(default)]
    pub end_time: Option<f64>,
    #[serde(default)]
    pub duration: Option<f64>,
    pub message: String,
    #[serde(default)]
    pub module_name: Option<String>,
    pub node_status: NodeStatus,
}

impl StepHistoryEntry {
    pub fn open(step_index: usize, step_name: impl Into<String>, start_time: f64, module_name: Option<String>) -> Self {
        Self {
            step_index,
            step_name: step_name.into(),
            start_time,
            end_time: None,
            duration: None,
            message: String::new(),
            module_name,
            node_status: NodeStatus::Start,
        }
    }

    pub fn close(&mut self, end_time: f64, node_status: NodeStatus) {
        self.end_time = Some(end_time);
        self.duration = Some((end_time - self.start_time).max(0.0));
        self.node_status = node_status;
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}
