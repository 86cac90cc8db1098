//! Wire types published on the message fabric.

use serde::{Deserialize, Serialize};

use super::step::NodeStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub analysis_id: String,
    pub current_step: usize,
    pub total_steps: usize,
    pub progress_percentage: f64,
    pub current_step_name: String,
    pub current_step_description: String,
    pub elapsed_time: f64,
    pub remaining_time: f64,
    pub last_message: String,
    #[serde(default)]
    pub module_name: Option<String>,
    pub node_status: NodeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    pub analysis_id: String,
    pub status: String,
    pub message: String,
    pub timestamp: f64,
}
