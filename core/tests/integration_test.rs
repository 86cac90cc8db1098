//! End-to-end tests exercising `TaskManager` the way a caller would: submit
//! a task, drive it with the control protocol, observe status/history/cache
//! behavior through the public API only, never a submodule's internals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use orchestrator_store::{LocalFileStore, StateStore};
use taskengine::control::ControlManager;
use taskengine::domain::{AnalysisParams, CacheReuseConfig, MarketType, TaskStatus};
use taskengine::fabric::InMemoryFabric;
use taskengine::pipeline::{AgentStage, EchoAgentStage, TaskManager, TaskManagerConfig};

fn params(symbol: &str, analysts: &[&str], research_depth: u8, cache_reuse_config: Option<CacheReuseConfig>) -> AnalysisParams {
    AnalysisParams {
        stock_symbol: symbol.to_string(),
        market_type: MarketType::UsStock,
        analysis_date: Some("2026-01-15".to_string()),
        analysts: analysts.iter().map(|s| s.to_string()).collect(),
        research_depth,
        include_sentiment: false,
        include_risk_assessment: false,
        custom_prompt: None,
        extra_config: serde_json::Value::Null,
        cache_reuse_config,
    }
}

async fn manager_with_echo_agents(dir: &std::path::Path, delay: Duration) -> TaskManager {
    let store: Arc<dyn StateStore> = Arc::new(LocalFileStore::open(dir).unwrap());
    let control_manager = Arc::new(ControlManager::new(dir.join("checkpoints")));
    let fabric: Arc<dyn taskengine::fabric::MessageFabric> = InMemoryFabric::new();

    let mut agents: HashMap<String, Arc<dyn AgentStage>> = HashMap::new();
    agents.insert("market_analyst".to_string(), Arc::new(EchoAgentStage::new("market_analyst", delay, json!({"market_analyst": {"report": "bullish"}}))));
    agents.insert("trader".to_string(), Arc::new(EchoAgentStage::new("trader", delay, json!({"trader": {"decision": "buy"}}))));
    agents.insert("risk_prompt".to_string(), Arc::new(EchoAgentStage::new("risk_prompt", delay, json!({"risk_prompt": {"note": "ok"}}))));

    let config = TaskManagerConfig { poll_interval: Duration::from_millis(20), ..Default::default() };
    TaskManager::new(config, control_manager, fabric, store, agents).await.unwrap()
}

async fn poll_until_terminal(manager: &TaskManager, task_id: &str) -> taskengine::domain::Task {
    let mut task = manager.get_task_status(task_id).await;
    for _ in 0..300 {
        if task.as_ref().map(|t| t.status.is_terminal()).unwrap_or(false) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        task = manager.get_task_status(task_id).await;
    }
    task.expect("task must exist")
}

#[tokio::test]
async fn happy_path_completes_and_persists_result() {
    let dir = tempfile::TempDir::new().unwrap();
    let manager = manager_with_echo_agents(dir.path(), Duration::from_millis(5)).await;

    let task_id = manager.start_task(params("AAPL", &["market"], 1, None)).await.unwrap();
    let task = poll_until_terminal(&manager, &task_id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.as_ref().unwrap()["market_analyst"]["report"], json!("bullish"));

    let history = manager.get_task_history(&task_id).await;
    assert!(history.len() >= 2, "history should record at least initialize + completion");
    assert_eq!(history.first().unwrap().status, TaskStatus::Pending);
    assert_eq!(history.last().unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn pause_then_resume_runs_to_completion() {
    let dir = tempfile::TempDir::new().unwrap();
    let manager = manager_with_echo_agents(dir.path(), Duration::from_millis(200)).await;

    let task_id = manager.start_task(params("MSFT", &["market"], 1, None)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(manager.pause_task(&task_id).await.unwrap());

    let paused = manager.get_task_status(&task_id).await.unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);

    // While paused, the task should not reach a terminal state.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let still_paused = manager.get_task_status(&task_id).await.unwrap();
    assert!(!still_paused.status.is_terminal());

    assert!(manager.resume_task(&task_id).await.unwrap());
    let task = poll_until_terminal(&manager, &task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn stop_mid_flight_marks_stopped_and_is_idempotent() {
    let dir = tempfile::TempDir::new().unwrap();
    let manager = manager_with_echo_agents(dir.path(), Duration::from_millis(500)).await;

    let task_id = manager.start_task(params("GOOG", &["market"], 1, None)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(manager.stop_task(&task_id).unwrap());
    // A second stop against an already-stopping task is not an error.
    assert!(manager.stop_task(&task_id).unwrap());

    let task = poll_until_terminal(&manager, &task_id).await;
    assert_eq!(task.status, TaskStatus::Stopped);
}

#[tokio::test]
async fn invalid_submissions_are_rejected_before_a_worker_is_spawned() {
    let dir = tempfile::TempDir::new().unwrap();
    let manager = manager_with_echo_agents(dir.path(), Duration::from_millis(5)).await;

    assert!(manager.start_task(params("AAPL", &[], 1, None)).await.is_err());
    assert!(manager.start_task(params("", &["market"], 1, None)).await.is_err());
    assert!(manager.start_task(params("AAPL", &["market"], 0, None)).await.is_err());
    assert!(manager.start_task(params("AAPL", &["market"], 6, None)).await.is_err());
}

#[tokio::test]
async fn cache_reuse_splices_prior_result_without_invoking_an_agent() {
    let dir = tempfile::TempDir::new().unwrap();

    // First run: a real agent produces the market_analyst output and the
    // task completes, landing in the store for the next manager to index.
    let first = manager_with_echo_agents(dir.path(), Duration::from_millis(5)).await;
    let first_id = first.start_task(params("TSLA", &["market"], 1, None)).await.unwrap();
    let first_task = poll_until_terminal(&first, &first_id).await;
    assert_eq!(first_task.status, TaskStatus::Completed);
    first.shutdown().await;

    // Second manager, same store directory, with NO agents registered at
    // all: the only way this task can complete is by reusing the cache.
    let store: Arc<dyn StateStore> = Arc::new(LocalFileStore::open(dir.path()).unwrap());
    let control_manager = Arc::new(ControlManager::new(dir.path().join("checkpoints")));
    let fabric: Arc<dyn taskengine::fabric::MessageFabric> = InMemoryFabric::new();
    let config = TaskManagerConfig {
        poll_interval: Duration::from_millis(20),
        default_cache_sleep_min: 0.01,
        default_cache_sleep_max: 0.02,
        ..Default::default()
    };
    let second = TaskManager::new(config, control_manager, fabric, store, HashMap::new()).await.unwrap();

    let cache_reuse = CacheReuseConfig { all: Some(true), ..Default::default() };
    let second_id = second.start_task(params("TSLA", &["market"], 1, Some(cache_reuse))).await.unwrap();
    let second_task = poll_until_terminal(&second, &second_id).await;

    assert_eq!(second_task.status, TaskStatus::Completed);
    assert_eq!(second_task.result.as_ref().unwrap()["market_analyst"]["report"], json!("bullish"));
}

#[tokio::test]
async fn restart_recovery_marks_orphaned_running_task_failed() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = LocalFileStore::open(dir.path()).unwrap();

    // Simulate a process crash: a task document persisted as RUNNING with
    // no worker actually alive to drive it.
    let orphan_doc = json!({
        "task_id": "orphan-1",
        "status": "running",
        "created_at": chrono::Utc::now(),
        "updated_at": chrono::Utc::now(),
        "params": {
            "stock_symbol": "NFLX",
            "market_type": "美股",
            "analysis_date": "2026-01-15",
            "analysts": ["market"],
            "research_depth": 1,
            "include_sentiment": false,
            "include_risk_assessment": false,
            "custom_prompt": null,
            "extra_config": null,
            "cache_reuse_config": null,
        },
        "progress": {"current_step": 0, "total_steps": 1, "percentage": 0.0, "message": "", "analysis_start_time": 0.0},
        "current_step": null,
        "result": null,
        "error": null,
        "cache_reuse_config": null,
        "checkpoint": null,
    });
    store.save_current("orphan-1", &orphan_doc).await.unwrap();

    let manager = manager_with_echo_agents(dir.path(), Duration::from_millis(5)).await;
    let recovered = manager.get_task_status("orphan-1").await.expect("orphan task must still exist");
    assert_eq!(recovered.status, TaskStatus::Failed);
    assert!(recovered.error.is_some());
}
