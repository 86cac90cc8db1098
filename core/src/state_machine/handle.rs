use std::sync::Arc;

use chrono::Utc;
use orchestrator_store::StateStore;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::domain::{Progress, Task, TaskStatus};

use super::messages::{StateMachineError, TaskCommand, TaskStateEvent};

/// Field-wise patch applied by `update_state`. Unset fields are left
/// untouched on the task record; `progress` is itself merged field-wise.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub progress: Option<ProgressPatch>,
    pub current_step: Option<crate::domain::StepHistoryEntry>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub checkpoint: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressPatch {
    pub current_step: Option<usize>,
    pub total_steps: Option<usize>,
    pub percentage: Option<f64>,
    pub message: Option<String>,
    pub analysis_start_time: Option<f64>,
}

fn apply_progress_patch(progress: &mut Progress, patch: ProgressPatch) {
    if let Some(v) = patch.current_step {
        progress.current_step = v;
    }
    if let Some(v) = patch.total_steps {
        progress.total_steps = v;
    }
    if let Some(v) = patch.percentage {
        progress.percentage = v;
    }
    if let Some(v) = patch.message {
        progress.message = v;
    }
    if let Some(v) = patch.analysis_start_time {
        progress.analysis_start_time = v;
    }
}

/// Cloneable front for the task's single-owner actor loop. One instance per
/// task; the loop itself is the per-task serialization point required by
/// the concurrency model.
#[derive(Clone)]
pub struct TaskStateMachineHandle {
    task_id: String,
    tx: mpsc::Sender<TaskCommand>,
    events: broadcast::Sender<TaskStateEvent>,
}

impl TaskStateMachineHandle {
    /// Spawns the owning actor loop and returns a handle to it.
    pub fn spawn(task_id: impl Into<String>, store: Arc<dyn StateStore>) -> Self {
        let task_id = task_id.into();
        debug!(%task_id, "TaskStateMachineHandle::spawn: called");
        let (tx, rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(64);
        let events_for_loop = events.clone();
        let loop_task_id = task_id.clone();
        tokio::spawn(async move {
            run_actor(loop_task_id, store, rx, events_for_loop).await;
        });
        Self { task_id, tx, events }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskStateEvent> {
        self.events.subscribe()
    }

    pub async fn initialize(&self, params: crate::domain::AnalysisParams) -> Result<Task, StateMachineError> {
        debug!(task_id = %self.task_id, "TaskStateMachineHandle::initialize: called");
        let (reply, rx) = oneshot::channel();
        self.send(TaskCommand::Initialize { params, reply }).await?;
        rx.await.map_err(|_| actor_gone(&self.task_id))?
    }

    pub async fn update_state(&self, patch: TaskPatch) -> Result<Task, StateMachineError> {
        debug!(task_id = %self.task_id, "TaskStateMachineHandle::update_state: called");
        let updates = serde_json::to_value(&PatchEnvelope(patch)).expect("patch envelope is always serializable");
        let (reply, rx) = oneshot::channel();
        self.send(TaskCommand::UpdateState { updates, reply }).await?;
        rx.await.map_err(|_| actor_gone(&self.task_id))?
    }

    pub async fn get_current_state(&self) -> Option<Task> {
        let (reply, rx) = oneshot::channel();
        if self.send(TaskCommand::GetCurrent { reply }).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn get_history_states(&self) -> Vec<Task> {
        let (reply, rx) = oneshot::channel();
        if self.send(TaskCommand::GetHistory { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn shutdown(&self) {
        let _ = self.send(TaskCommand::Shutdown).await;
    }

    async fn send(&self, cmd: TaskCommand) -> Result<(), StateMachineError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| StateMachineError::NotFound(self.task_id.clone()))
    }
}

fn actor_gone(task_id: &str) -> StateMachineError {
    StateMachineError::NotFound(task_id.to_string())
}

/// Carries a `TaskPatch` through the command channel as a `Value` so
/// `TaskCommand` stays serde-free; unwrapped back into a `TaskPatch` inside
/// the actor loop. A thin wrapper rather than threading the typed patch
/// through the channel directly, since the channel commits to passing
/// opaque `updates: Value`.
struct PatchEnvelope(TaskPatch);

impl serde::Serialize for PatchEnvelope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let p = &self.0;
        let mut s = serializer.serialize_struct("TaskPatch", 6)?;
        s.serialize_field("status", &p.status)?;
        s.serialize_field(
            "progress",
            &p.progress.as_ref().map(|pp| {
                (
                    pp.current_step,
                    pp.total_steps,
                    pp.percentage,
                    pp.message.clone(),
                    pp.analysis_start_time,
                )
            }),
        )?;
        s.serialize_field("current_step", &p.current_step)?;
        s.serialize_field("result", &p.result)?;
        s.serialize_field("error", &p.error)?;
        s.serialize_field("checkpoint", &p.checkpoint)?;
        s.end()
    }
}

async fn run_actor(
    task_id: String,
    store: Arc<dyn StateStore>,
    mut rx: mpsc::Receiver<TaskCommand>,
    events: broadcast::Sender<TaskStateEvent>,
) {
    let mut current: Option<Task> = None;
    let span = tracing::info_span!("task", task_id = %task_id);
    let _guard = span.enter();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            TaskCommand::Initialize { params, reply } => {
                let result = do_initialize(&task_id, &store, &mut current, params).await;
                if let Ok(task) = &result {
                    let _ = events.send(TaskStateEvent::Initialized(Box::new(task.clone())));
                }
                let _ = reply.send(result);
            }
            TaskCommand::UpdateState { updates, reply } => {
                let result = do_update(&task_id, &store, &mut current, updates).await;
                if let Ok(task) = &result {
                    let _ = events.send(TaskStateEvent::Updated(Box::new(task.clone())));
                }
                let _ = reply.send(result);
            }
            TaskCommand::GetCurrent { reply } => {
                let _ = reply.send(current.clone());
            }
            TaskCommand::GetHistory { reply } => {
                let history = store.load_history(&task_id).await.unwrap_or_else(|e| {
                    warn!(%task_id, error = %e, "run_actor: load_history failed");
                    Vec::new()
                });
                let tasks = history
                    .into_iter()
                    .filter_map(|v| serde_json::from_value(v).ok())
                    .collect();
                let _ = reply.send(tasks);
            }
            TaskCommand::Shutdown => {
                debug!(%task_id, "run_actor: shutdown requested");
                break;
            }
        }
    }
    debug!(%task_id, "run_actor: loop exited");
}

async fn do_initialize(
    task_id: &str,
    store: &Arc<dyn StateStore>,
    current: &mut Option<Task>,
    params: crate::domain::AnalysisParams,
) -> Result<Task, StateMachineError> {
    if current.is_some() {
        return Err(StateMachineError::AlreadyExists(task_id.to_string()));
    }
    if store.load_current(task_id).await?.is_some() {
        return Err(StateMachineError::AlreadyExists(task_id.to_string()));
    }
    let task = Task::new(task_id, params);
    let snapshot = serde_json::to_value(&task).expect("Task always serializes");
    if let Err(e) = store.save_current(task_id, &snapshot).await {
        warn!(%task_id, error = %e, "do_initialize: save_current failed, continuing with in-memory copy");
    }
    if let Err(e) = store.append_history(task_id, &snapshot).await {
        warn!(%task_id, error = %e, "do_initialize: append_history failed");
    }
    info!(%task_id, "do_initialize: task created");
    *current = Some(task.clone());
    Ok(task)
}

async fn do_update(
    task_id: &str,
    store: &Arc<dyn StateStore>,
    current: &mut Option<Task>,
    updates: Value,
) -> Result<Task, StateMachineError> {
    if current.is_none() {
        *current = store
            .load_current(task_id)
            .await?
            .and_then(|v| serde_json::from_value(v).ok());
    }
    let Some(existing) = current.clone() else {
        return Err(StateMachineError::NotFound(task_id.to_string()));
    };

    if existing.is_terminal() {
        error!(%task_id, status = %existing.status, "do_update: rejected, task already terminal");
        return Err(StateMachineError::InvariantViolation {
            task_id: task_id.to_string(),
            reason: format!("task already in terminal status {}", existing.status),
        });
    }

    let pre_mutation = existing.clone();
    let mut updated = existing;

    if let Some(status_value) = updates.get("status")
        && !status_value.is_null()
    {
        let next: TaskStatus = serde_json::from_value(status_value.clone()).map_err(|e| StateMachineError::InvariantViolation {
            task_id: task_id.to_string(),
            reason: format!("malformed status patch: {e}"),
        })?;
        if !updated.status.can_transition_to(next) {
            return Err(StateMachineError::InvariantViolation {
                task_id: task_id.to_string(),
                reason: format!("illegal transition {} -> {}", updated.status, next),
            });
        }
        updated.status = next;
    }

    if let Some(progress_value) = updates.get("progress")
        && !progress_value.is_null()
        && let Some(tuple) = progress_value.as_array()
    {
        if let Some(v) = tuple.first().and_then(|v| v.as_u64()) {
            updated.progress.current_step = v as usize;
        }
        if let Some(v) = tuple.get(1).and_then(|v| v.as_u64()) {
            updated.progress.total_steps = v as usize;
        }
        if let Some(v) = tuple.get(2).and_then(|v| v.as_f64()) {
            updated.progress.percentage = v;
        }
        if let Some(v) = tuple.get(3).and_then(|v| v.as_str()) {
            updated.progress.message = v.to_string();
        }
        if let Some(v) = tuple.get(4).and_then(|v| v.as_f64()) {
            updated.progress.analysis_start_time = v;
        }
    }

    if let Some(step_value) = updates.get("current_step")
        && !step_value.is_null()
        && let Ok(step) = serde_json::from_value(step_value.clone())
    {
        updated.current_step = Some(step);
    }

    if let Some(result_value) = updates.get("result")
        && !result_value.is_null()
    {
        updated.result = Some(result_value.clone());
    }

    if let Some(error_value) = updates.get("error")
        && let Some(msg) = error_value.as_str()
    {
        updated.error = Some(msg.to_string());
    }

    if let Some(checkpoint_value) = updates.get("checkpoint")
        && !checkpoint_value.is_null()
    {
        updated.checkpoint = Some(checkpoint_value.clone());
    }

    updated.updated_at = Utc::now().max(pre_mutation.updated_at);

    let snapshot = serde_json::to_value(&updated).expect("Task always serializes");
    if let Err(e) = store.save_current(task_id, &snapshot).await {
        warn!(%task_id, error = %e, "do_update: save_current failed, in-memory copy remains authoritative");
    }
    let pre_snapshot = serde_json::to_value(&pre_mutation).expect("Task always serializes");
    if let Err(e) = store.append_history(task_id, &pre_snapshot).await {
        warn!(%task_id, error = %e, "do_update: append_history failed");
    }

    *current = Some(updated.clone());
    Ok(updated)
}
