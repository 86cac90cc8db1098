//! Task record: the central entity mutated exclusively through the task
//! state machine's `update_state` operation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Status enum. Transitions: PENDING -> RUNNING -> {PAUSED <-> RUNNING}* ->
/// {COMPLETED | FAILED | STOPPED}. Once terminal, no further transition is
/// permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl TaskStatus {
    /// Terminal statuses accept no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped | Self::Cancelled)
    }

    /// A task actively making progress (worker not suspended).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// A task that can transition back to Running.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Paused)
    }

    /// Whether `next` is a legal transition from `self` per the lifecycle
    /// invariant in the data model.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Cancelled) => true,
            (Self::Running, Self::Paused) => true,
            (Self::Running, Self::Completed | Self::Failed | Self::Stopped) => true,
            (Self::Paused, Self::Running) => true,
            (Self::Paused, Self::Stopped | Self::Failed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    /// A-share (mainland China)
    #[serde(rename = "A股")]
    AShare,
    /// Hong Kong
    #[serde(rename = "港股")]
    HongKong,
    /// US market
    #[serde(rename = "美股")]
    UsStock,
}

/// Submission payload. Validated by `TaskManager::start_task` before a task
/// is ever created; an invalid `AnalysisParams` never reaches the state
/// machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisParams {
    pub stock_symbol: String,
    pub market_type: MarketType,
    pub analysis_date: Option<String>,
    pub analysts: Vec<String>,
    pub research_depth: u8,
    #[serde(default)]
    pub include_sentiment: bool,
    #[serde(default)]
    pub include_risk_assessment: bool,
    #[serde(default)]
    pub custom_prompt: Option<String>,
    #[serde(default)]
    pub extra_config: Value,
    #[serde(default)]
    pub cache_reuse_config: Option<CacheReuseConfig>,
}

/// Per-task gate controlling which pipeline nodes may reuse cached output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheReuseConfig {
    /// When set, overrides the per-node map for every node.
    #[serde(default)]
    pub all: Option<bool>,
    #[serde(default)]
    pub nodes: HashMap<String, bool>,
    #[serde(default)]
    pub sleep_min: Option<f64>,
    #[serde(default)]
    pub sleep_max: Option<f64>,
}

impl CacheReuseConfig {
    /// Whether `node_name` is granted reuse by this config.
    pub fn allows(&self, node_name: &str) -> bool {
        if let Some(all) = self.all {
            return all;
        }
        self.nodes.get(node_name).copied().unwrap_or(false)
    }
}

/// `{current_step, total_steps, percentage, message, analysis_start_time}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub current_step: usize,
    pub total_steps: usize,
    pub percentage: f64,
    pub message: String,
    pub analysis_start_time: f64,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            current_step: 0,
            total_steps: 0,
            percentage: 0.0,
            message: String::new(),
            analysis_start_time: 0.0,
        }
    }
}

/// The central task record. Mutated only through
/// `state_machine::TaskStateMachineHandle::update_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub params: AnalysisParams,
    pub progress: Progress,
    pub current_step: Option<super::step::StepHistoryEntry>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub cache_reuse_config: Option<CacheReuseConfig>,
    #[serde(default)]
    pub checkpoint: Option<Value>,
}

impl Task {
    pub fn new(task_id: impl Into<String>, params: AnalysisParams) -> Self {
        let task_id = task_id.into();
        debug!(%task_id, "Task::new: called");
        let now = Utc::now();
        let cache_reuse_config = params.cache_reuse_config.clone();
        Self {
            task_id,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            params,
            progress: Progress::default(),
            current_step: None,
            result: None,
            error: None,
            cache_reuse_config,
            checkpoint: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_resumable(&self) -> bool {
        self.status.is_resumable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AnalysisParams {
        AnalysisParams {
            stock_symbol: "AAPL".into(),
            market_type: MarketType::UsStock,
            analysis_date: Some("2024-06-01".into()),
            analysts: vec!["market".into()],
            research_depth: 1,
            include_sentiment: false,
            include_risk_assessment: false,
            custom_prompt: None,
            extra_config: Value::Null,
            cache_reuse_config: None,
        }
    }

    #[test]
    fn new_task_is_pending() {
        let task = Task::new("t1", params());
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(!task.is_terminal());
        assert_eq!(task.created_at, task.updated_at);
    }

    #[test]
    fn transition_table_matches_lifecycle_invariant() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Paused));
        assert!(TaskStatus::Paused.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn cache_reuse_config_all_overrides_per_node() {
        let mut cfg = CacheReuseConfig {
            all: Some(false),
            ..Default::default()
        };
        cfg.nodes.insert("market_analyst".into(), true);
        assert!(!cfg.allows("market_analyst"));

        cfg.all = None;
        assert!(cfg.allows("market_analyst"));
        assert!(!cfg.allows("news_analyst"));
    }
}
