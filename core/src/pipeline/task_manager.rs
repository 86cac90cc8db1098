use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use orchestrator_store::StateStore;

use crate::cache::ResultReuseCache;
use crate::control::ControlManager;
use crate::domain::{AnalysisParams, Step, StepHistoryEntry, Task, TaskStatus};
use crate::fabric::MessageFabric;
use crate::progress::{ProgressTracker, step_plan};
use crate::state_machine::{TaskPatch, TaskStateMachineHandle};

use super::agent::AgentStage;
use super::error::PipelineError;
use super::worker::{WorkerConfig, WorkerOutcome, run_worker};

#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    pub max_concurrent_tasks: usize,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
    pub default_cache_sleep_min: f64,
    pub default_cache_sleep_max: f64,
    pub duration_provider: String,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 16,
            poll_interval: Duration::from_millis(250),
            shutdown_timeout: Duration::from_secs(30),
            default_cache_sleep_min: 2.0,
            default_cache_sleep_max: 10.0,
            duration_provider: "dashscope".to_string(),
        }
    }
}

struct RunningTask {
    handle: JoinHandle<WorkerOutcome>,
    state_machine: TaskStateMachineHandle,
    tracker: Arc<ProgressTracker>,
}

/// Owns the concurrency limiter, the registry of live workers, and handles
/// to every other component. `run()` is a reap-on-tick / shutdown-on-signal
/// `tokio::select!` loop.
pub struct TaskManager {
    config: TaskManagerConfig,
    semaphore: Arc<Semaphore>,
    tasks: Mutex<HashMap<String, RunningTask>>,
    control_manager: Arc<ControlManager>,
    fabric: Arc<dyn MessageFabric>,
    store: Arc<dyn StateStore>,
    cache: Arc<ResultReuseCache>,
    agents: Arc<HashMap<String, Arc<dyn AgentStage>>>,
}

impl TaskManager {
    pub async fn new(
        config: TaskManagerConfig,
        control_manager: Arc<ControlManager>,
        fabric: Arc<dyn MessageFabric>,
        store: Arc<dyn StateStore>,
        agents: HashMap<String, Arc<dyn AgentStage>>,
    ) -> Result<Self, PipelineError> {
        let cache = Arc::new(ResultReuseCache::rebuild(store.clone(), config.poll_interval).await?);
        let manager = Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            config,
            tasks: Mutex::new(HashMap::new()),
            control_manager,
            fabric,
            store,
            cache,
            agents: Arc::new(agents),
        };
        manager.recover_interrupted_tasks().await?;
        Ok(manager)
    }

    /// Scans the store for tasks whose persisted status is RUNNING or
    /// PAUSED with no corresponding live worker (always true right after
    /// construction) and re-labels them FAILED.
    async fn recover_interrupted_tasks(&self) -> Result<(), PipelineError> {
        info!("TaskManager::recover_interrupted_tasks: scanning for orphaned tasks");
        let mut recovered = 0usize;
        for task_id in self.store.list_task_ids().await? {
            let Some(doc) = self.store.load_current(&task_id).await? else { continue };
            let Ok(task) = serde_json::from_value::<Task>(doc) else { continue };
            if !matches!(task.status, TaskStatus::Running | TaskStatus::Paused) {
                continue;
            }
            let state_machine = TaskStateMachineHandle::spawn(task_id.clone(), self.store.clone());
            if let Err(e) = state_machine
                .update_state(TaskPatch { status: Some(TaskStatus::Failed), error: Some("worker died".to_string()), ..Default::default() })
                .await
            {
                warn!(%task_id, error = %e, "recover_interrupted_tasks: failed to mark orphaned task FAILED");
                continue;
            }
            self.fabric
                .publish(
                    crate::fabric::TOPIC_TASK_STATUS,
                    crate::fabric::FabricMessage::Status(crate::domain::StatusMessage {
                        analysis_id: task_id.clone(),
                        status: "failed".to_string(),
                        message: "worker died".to_string(),
                        timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
                    }),
                )
                .await;
            recovered += 1;
        }
        info!(recovered, "TaskManager::recover_interrupted_tasks: done");
        Ok(())
    }

    fn validate(params: &AnalysisParams) -> Result<(), PipelineError> {
        if params.stock_symbol.trim().is_empty() || !params.stock_symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(PipelineError::Validation(format!("invalid stock_symbol: {:?}", params.stock_symbol)));
        }
        if params.analysts.is_empty() {
            return Err(PipelineError::Validation("analysts must not be empty".to_string()));
        }
        if !(1..=5).contains(&params.research_depth) {
            return Err(PipelineError::Validation(format!("research_depth out of range 1..=5: {}", params.research_depth)));
        }
        Ok(())
    }

    /// Generates `task_id`, registers control primitives, initializes the
    /// state machine and progress tracker, and spawns the worker. Returns
    /// as soon as the worker is scheduled.
    pub async fn start_task(&self, params: AnalysisParams) -> Result<String, PipelineError> {
        Self::validate(&params)?;

        let task_id = uuid::Uuid::new_v4().to_string();
        debug!(%task_id, stock_symbol = %params.stock_symbol, "TaskManager::start_task: accepted");

        let control = self.control_manager.register(&task_id);
        let state_machine = TaskStateMachineHandle::spawn(task_id.clone(), self.store.clone());
        state_machine.initialize(params.clone()).await?;

        let plan = step_plan::plan(&params.analysts, params.research_depth, params.market_type);
        let estimated = step_plan::duration_estimate_seconds(&params.analysts, params.research_depth, &self.config.duration_provider);
        let tracker = Arc::new(ProgressTracker::new(task_id.clone(), plan.clone(), state_machine.clone(), self.fabric.clone(), estimated));

        let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore never closed");
        let worker_config = Arc::new(WorkerConfig {
            poll_interval: self.config.poll_interval,
            default_cache_sleep_min: self.config.default_cache_sleep_min,
            default_cache_sleep_max: self.config.default_cache_sleep_max,
        });

        let spawned_task_id = task_id.clone();
        let worker_state_machine = state_machine.clone();
        let worker_tracker = tracker.clone();
        let worker_control = control.clone();
        let cache = self.cache.clone();
        let agents = self.agents.clone();

        let handle = tokio::spawn(async move {
            let outcome = run_worker(spawned_task_id, params, plan, worker_state_machine, worker_tracker, worker_control, cache, agents, worker_config).await;
            drop(permit);
            outcome
        });

        self.tasks.lock().expect("tasks lock poisoned").insert(task_id.clone(), RunningTask { handle, state_machine, tracker });
        Ok(task_id)
    }

    /// No batch-wide transactional semantics: failures are per-item.
    pub async fn start_task_batch(&self, batch: Vec<AnalysisParams>) -> Vec<Result<String, PipelineError>> {
        let mut results = Vec::with_capacity(batch.len());
        for params in batch {
            results.push(self.start_task(params).await);
        }
        results
    }

    pub async fn pause_task(&self, task_id: &str) -> Result<bool, PipelineError> {
        let paused = self.control_manager.pause(task_id)?;
        if paused {
            let (tracker, state_machine) = {
                let tasks = self.tasks.lock().expect("tasks lock poisoned");
                let Some(t) = tasks.get(task_id) else { return Ok(paused) };
                (t.tracker.clone(), t.state_machine.clone())
            };
            tracker.mark_paused().await;
            // Stamp the restart hint the control handle just wrote to disk onto
            // the task record itself, so a reader of `Task` sees it without
            // reaching into the control manager's checkpoint directory.
            if let Some(checkpoint) = self.control_manager.get(task_id).and_then(|h| h.load_checkpoint())
                && let Err(e) = state_machine.update_state(TaskPatch { checkpoint: Some(checkpoint), ..Default::default() }).await
            {
                warn!(%task_id, error = %e, "pause_task: checkpoint update failed");
            }
        }
        Ok(paused)
    }

    pub async fn resume_task(&self, task_id: &str) -> Result<bool, PipelineError> {
        let resumed = self.control_manager.resume(task_id)?;
        if resumed {
            let (tracker, state_machine) = {
                let tasks = self.tasks.lock().expect("tasks lock poisoned");
                let Some(t) = tasks.get(task_id) else { return Ok(resumed) };
                (t.tracker.clone(), t.state_machine.clone())
            };
            tracker.mark_resumed().await;
            if let Some(checkpoint) = self.control_manager.get(task_id).and_then(|h| h.load_checkpoint())
                && let Err(e) = state_machine.update_state(TaskPatch { checkpoint: Some(checkpoint), ..Default::default() }).await
            {
                warn!(%task_id, error = %e, "resume_task: checkpoint update failed");
            }
        }
        Ok(resumed)
    }

    /// Idempotent: returns `true` whether or not the task was already
    /// stopped, matching `ControlHandle::stop`.
    pub fn stop_task(&self, task_id: &str) -> Result<bool, PipelineError> {
        Ok(self.control_manager.stop(task_id)?)
    }

    pub async fn get_task_status(&self, task_id: &str) -> Option<Task> {
        if let Some(task) = self.tasks.lock().expect("tasks lock poisoned").get(task_id) {
            if let Some(t) = task.state_machine.get_current_state().await {
                return Some(t);
            }
        }
        self.store.load_current(task_id).await.ok().flatten().and_then(|v| serde_json::from_value(v).ok())
    }

    pub async fn get_task_history(&self, task_id: &str) -> Vec<Task> {
        if let Some(task) = self.tasks.lock().expect("tasks lock poisoned").get(task_id) {
            return task.state_machine.get_history_states().await;
        }
        self.store.load_history(task_id).await.unwrap_or_default().into_iter().filter_map(|v| serde_json::from_value(v).ok()).collect()
    }

    pub fn get_task_planned_steps(&self, task_id: &str) -> Option<Vec<Step>> {
        self.tasks.lock().expect("tasks lock poisoned").get(task_id).map(|t| t.tracker.plan().steps.clone())
    }

    pub fn get_task_current_step(&self, task_id: &str) -> Option<StepHistoryEntry> {
        self.tasks.lock().expect("tasks lock poisoned").get(task_id).and_then(|t| t.tracker.current_entry())
    }

    /// Reaps finished worker handles, unregistering their control
    /// primitives. `WorkerOutcome` carries the task's own terminal status
    /// already persisted by the worker; this just frees bookkeeping.
    async fn reap_completed(&self) {
        let finished: Vec<(String, JoinHandle<WorkerOutcome>)> = {
            let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
            let finished_ids: Vec<String> = tasks.iter().filter(|(_, t)| t.handle.is_finished()).map(|(id, _)| id.clone()).collect();
            finished_ids.into_iter().filter_map(|id| tasks.remove(&id).map(|t| (id, t.handle))).collect()
        };
        for (task_id, handle) in finished {
            self.control_manager.unregister(&task_id);
            match handle.await {
                Ok(WorkerOutcome::Completed { task_id }) => info!(%task_id, "worker completed"),
                Ok(WorkerOutcome::Failed { task_id, reason }) => error!(%task_id, %reason, "worker failed"),
                Ok(WorkerOutcome::Stopped { task_id }) => info!(%task_id, "worker stopped"),
                Err(e) => error!(%task_id, error = %e, "worker task panicked"),
            }
        }
    }

    /// Reaps finished workers on an interval tick and accepts an external
    /// shutdown signal.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.poll_interval.max(Duration::from_millis(250)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reap_completed().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("TaskManager::run: shutdown signal received");
                    break;
                }
            }
        }
        self.shutdown().await;
    }

    /// Broadcasts stop to all registered tasks, waits up to
    /// `shutdown_timeout` reaping every 250ms, then force-aborts
    /// stragglers.
    pub async fn shutdown(&self) {
        let task_ids: Vec<String> = self.tasks.lock().expect("tasks lock poisoned").keys().cloned().collect();
        info!(count = task_ids.len(), "TaskManager::shutdown: stopping all tasks");
        for task_id in &task_ids {
            let _ = self.control_manager.stop(task_id);
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        while !self.tasks.lock().expect("tasks lock poisoned").is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(250)).await;
            self.reap_completed().await;
        }

        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        if !tasks.is_empty() {
            warn!(count = tasks.len(), "TaskManager::shutdown: aborting stragglers after timeout");
            for (task_id, running) in tasks.drain() {
                running.handle.abort();
                self.control_manager.unregister(&task_id);
            }
        }
        info!("TaskManager::shutdown: complete");
    }
}
