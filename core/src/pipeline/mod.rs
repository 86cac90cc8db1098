//! Task Manager / pipeline runner: accepts submissions, orchestrates each
//! task's worker through the generated step list, enforces the control
//! protocol, and reports results. The `AgentStage` seam stands in for the
//! out-of-scope agent implementations.

mod agent;
mod error;
mod task_manager;
mod worker;

pub use agent::{AgentStage, EchoAgentStage, StageContext};
pub use error::{AgentError, PipelineError};
pub use task_manager::{TaskManager, TaskManagerConfig};
pub use worker::{WorkerConfig, WorkerOutcome};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlManager;
    use crate::domain::{AnalysisParams, MarketType};
    use crate::fabric::InMemoryFabric;
    use orchestrator_store::LocalFileStore;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn params(analysts: &[&str], research_depth: u8) -> AnalysisParams {
        AnalysisParams {
            stock_symbol: "AAPL".to_string(),
            market_type: MarketType::UsStock,
            analysis_date: Some("2024-06-01".to_string()),
            analysts: analysts.iter().map(|s| s.to_string()).collect(),
            research_depth,
            include_sentiment: false,
            include_risk_assessment: false,
            custom_prompt: None,
            extra_config: serde_json::Value::Null,
            cache_reuse_config: None,
        }
    }

    async fn new_manager(dir: &std::path::Path) -> TaskManager {
        let store: Arc<dyn orchestrator_store::StateStore> = Arc::new(LocalFileStore::open(dir).unwrap());
        let control_manager = Arc::new(ControlManager::new(dir.join("checkpoints")));
        let fabric: Arc<dyn crate::fabric::MessageFabric> = InMemoryFabric::new();

        let mut agents: HashMap<String, Arc<dyn AgentStage>> = HashMap::new();
        agents.insert(
            "market_analyst".to_string(),
            Arc::new(EchoAgentStage::new("market_analyst", Duration::from_millis(5), json!({"market_report": "bullish"}))),
        );
        agents.insert("trader".to_string(), Arc::new(EchoAgentStage::new("trader", Duration::from_millis(5), json!({"trade_decision": "buy"}))));
        agents.insert("risk_prompt".to_string(), Arc::new(EchoAgentStage::new("risk_prompt", Duration::from_millis(5), json!({"risk_note": "ok"}))));
        agents.insert(
            "graph_signal_processing".to_string(),
            Arc::new(EchoAgentStage::new("graph_signal_processing", Duration::from_millis(5), json!({"final_signal": "BUY"}))),
        );

        let config = TaskManagerConfig { poll_interval: Duration::from_millis(20), ..Default::default() };
        TaskManager::new(config, control_manager, fabric, store, agents).await.unwrap()
    }

    #[tokio::test]
    async fn start_task_runs_to_completion() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = new_manager(dir.path()).await;

        let task_id = manager.start_task(params(&["market"], 1)).await.unwrap();

        let mut task = manager.get_task_status(&task_id).await;
        for _ in 0..200 {
            if task.as_ref().map(|t| t.status.is_terminal()).unwrap_or(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            task = manager.get_task_status(&task_id).await;
        }

        let task = task.expect("task must exist");
        assert_eq!(task.status, crate::domain::TaskStatus::Completed);
        assert_eq!(task.result.as_ref().unwrap()["market_report"], json!("bullish"));
    }

    #[tokio::test]
    async fn start_task_rejects_empty_analysts() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = new_manager(dir.path()).await;
        let err = manager.start_task(params(&[], 1)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn stop_task_mid_flight_marks_stopped() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut agents: HashMap<String, Arc<dyn AgentStage>> = HashMap::new();
        agents.insert(
            "market_analyst".to_string(),
            Arc::new(EchoAgentStage::new("market_analyst", Duration::from_millis(500), json!({"market_report": "bullish"}))),
        );
        let store: Arc<dyn orchestrator_store::StateStore> = Arc::new(LocalFileStore::open(dir.path()).unwrap());
        let control_manager = Arc::new(ControlManager::new(dir.path().join("checkpoints")));
        let fabric: Arc<dyn crate::fabric::MessageFabric> = InMemoryFabric::new();
        let config = TaskManagerConfig { poll_interval: Duration::from_millis(20), ..Default::default() };
        let manager = TaskManager::new(config, control_manager, fabric, store, agents).await.unwrap();

        let task_id = manager.start_task(params(&["market"], 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(manager.stop_task(&task_id).unwrap());

        let mut task = manager.get_task_status(&task_id).await;
        for _ in 0..200 {
            if task.as_ref().map(|t| t.status.is_terminal()).unwrap_or(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            task = manager.get_task_status(&task_id).await;
        }
        assert_eq!(task.unwrap().status, crate::domain::TaskStatus::Stopped);
    }
}
