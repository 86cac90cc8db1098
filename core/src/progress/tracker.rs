use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{NodeStatus, ProgressMessage, StatusMessage, StepHistoryEntry};
use crate::fabric::{FabricMessage, MessageFabric, TOPIC_TASK_PROGRESS, TOPIC_TASK_STATUS};
use crate::state_machine::{ProgressPatch, TaskPatch, TaskStateMachineHandle};

use super::StepPlan;

fn now_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Per-task control-state label mirrored for pause-duration accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlState {
    Running,
    Paused,
    Stopped,
}

struct Inner {
    control_state: ControlState,
    open_entries: HashMap<usize, StepHistoryEntry>,
    step_start_times: HashMap<usize, f64>,
    total_pause_duration: f64,
    current_pause_start: Option<f64>,
    current_step_index: usize,
}

/// Owns the generated [`StepPlan`], per-step timing, pause-duration
/// accounting, and publishes every update to the message fabric. Peer
/// mutator of the `Task` record alongside the state machine (per the
/// concurrency model, both run on the worker and are never called
/// concurrently with each other for the same task).
pub struct ProgressTracker {
    task_id: String,
    plan: StepPlan,
    state_machine: TaskStateMachineHandle,
    fabric: Arc<dyn MessageFabric>,
    start_time: f64,
    estimated_total_seconds: f64,
    inner: StdMutex<Inner>,
}

impl ProgressTracker {
    pub fn new(
        task_id: impl Into<String>,
        plan: StepPlan,
        state_machine: TaskStateMachineHandle,
        fabric: Arc<dyn MessageFabric>,
        estimated_total_seconds: f64,
    ) -> Self {
        let task_id = task_id.into();
        debug!(%task_id, steps = plan.steps.len(), "ProgressTracker::new: called");
        Self {
            task_id,
            plan,
            state_machine,
            fabric,
            start_time: now_secs(),
            estimated_total_seconds,
            inner: StdMutex::new(Inner {
                control_state: ControlState::Running,
                open_entries: HashMap::new(),
                step_start_times: HashMap::new(),
                total_pause_duration: 0.0,
                current_pause_start: None,
                current_step_index: 0,
            }),
        }
    }

    pub fn plan(&self) -> &StepPlan {
        &self.plan
    }

    /// The most recently opened step-history entry, open or closed.
    pub fn current_entry(&self) -> Option<StepHistoryEntry> {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        inner.open_entries.get(&inner.current_step_index).cloned()
    }

    /// `now - start_time - total_pause_duration - current_pause_duration_if_paused`.
    /// Never negative.
    pub fn effective_elapsed_time(&self) -> f64 {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        let mut elapsed = now_secs() - self.start_time - inner.total_pause_duration;
        if let Some(pause_start) = inner.current_pause_start {
            elapsed -= now_secs() - pause_start;
        }
        elapsed.max(0.0)
    }

    fn progress_percentage(&self, inner: &Inner) -> f64 {
        let mut pct = 0.0;
        for step in &self.plan.steps {
            if step.step_index < inner.current_step_index {
                pct += step.weight;
            } else if step.step_index == inner.current_step_index {
                let complete = inner
                    .open_entries
                    .get(&step.step_index)
                    .map(|e| !e.is_open())
                    .unwrap_or(false);
                if complete {
                    pct += step.weight;
                }
            }
        }
        pct.clamp(0.0, 1.0)
    }

    /// Advances the tracker's internal ledger for `current_step`, recomputes
    /// progress, persists via the state machine, and publishes a
    /// `ProgressMessage`.
    pub async fn update_from_message(&self, current_step: usize, module_name: Option<String>, node_status: NodeStatus, message: impl Into<String>) {
        let message = message.into();
        debug!(%self.task_id, current_step, ?module_name, ?node_status, "ProgressTracker::update_from_message: called");
        let now = now_secs();

        let (progress_pct, step_name, step_desc) = {
            let mut inner = self.inner.lock().expect("tracker lock poisoned");

            if current_step > inner.current_step_index {
                if let Some(mut stale) = inner.open_entries.remove(&inner.current_step_index)
                    && stale.is_open()
                {
                    stale.close(now, NodeStatus::Complete);
                    inner.open_entries.insert(inner.current_step_index, stale);
                }
            }
            inner.current_step_index = current_step;

            let entry = inner.open_entries.entry(current_step).or_insert_with(|| {
                let start = *inner.step_start_times.entry(current_step).or_insert(now);
                StepHistoryEntry::open(current_step, step_name_for(&self.plan, current_step), start, module_name.clone())
            });
            entry.message.clone_from(&message);

            if matches!(node_status, NodeStatus::Complete | NodeStatus::Error) && entry.is_open() {
                entry.close(now, node_status);
            }

            let pct = self.progress_percentage(&inner);
            (pct, step_name_for(&self.plan, current_step), step_desc_for(&self.plan, current_step))
        };

        let elapsed = self.effective_elapsed_time();
        let remaining = (self.estimated_total_seconds - elapsed).max(0.0);

        let patch = TaskPatch {
            progress: Some(ProgressPatch {
                current_step: Some(current_step),
                total_steps: Some(self.plan.steps.len()),
                percentage: Some(progress_pct),
                message: Some(message.clone()),
                analysis_start_time: Some(self.start_time),
            }),
            ..Default::default()
        };
        if let Err(e) = self.state_machine.update_state(patch).await {
            warn!(%self.task_id, error = %e, "update_from_message: state machine update failed");
        }

        let progress_message = ProgressMessage {
            analysis_id: self.task_id.clone(),
            current_step,
            total_steps: self.plan.steps.len(),
            progress_percentage: progress_pct,
            current_step_name: step_name,
            current_step_description: step_desc,
            elapsed_time: elapsed,
            remaining_time: remaining,
            last_message: message,
            module_name,
            node_status,
        };
        if !self.fabric.publish(TOPIC_TASK_PROGRESS, FabricMessage::Progress(progress_message)).await {
            warn!(%self.task_id, "update_from_message: publish dropped");
        }
    }

    async fn publish_status(&self, status: &str, message: impl Into<String>) {
        let status_message = StatusMessage {
            analysis_id: self.task_id.clone(),
            status: status.to_string(),
            message: message.into(),
            timestamp: now_secs(),
        };
        if !self.fabric.publish(TOPIC_TASK_STATUS, FabricMessage::Status(status_message)).await {
            warn!(%self.task_id, "publish_status: publish dropped");
        }
    }

    pub async fn mark_paused(&self) {
        {
            let mut inner = self.inner.lock().expect("tracker lock poisoned");
            if inner.control_state == ControlState::Paused {
                return;
            }
            inner.control_state = ControlState::Paused;
            inner.current_pause_start = Some(now_secs());
        }
        if let Err(e) = self.state_machine.update_state(crate::state_machine::TaskPatch { status: Some(crate::domain::TaskStatus::Paused), ..Default::default() }).await {
            warn!(%self.task_id, error = %e, "mark_paused: state update failed");
        }
        self.publish_status("paused", "task paused").await;
    }

    pub async fn mark_resumed(&self) {
        {
            let mut inner = self.inner.lock().expect("tracker lock poisoned");
            if inner.control_state != ControlState::Paused {
                return;
            }
            if let Some(pause_start) = inner.current_pause_start.take() {
                inner.total_pause_duration += now_secs() - pause_start;
            }
            inner.control_state = ControlState::Running;
        }
        if let Err(e) = self.state_machine.update_state(crate::state_machine::TaskPatch { status: Some(crate::domain::TaskStatus::Running), ..Default::default() }).await {
            warn!(%self.task_id, error = %e, "mark_resumed: state update failed");
        }
        self.publish_status("running", "task resumed").await;
    }

    pub async fn mark_stopped(&self, message: impl Into<String>) {
        let message = message.into();
        self.inner.lock().expect("tracker lock poisoned").control_state = ControlState::Stopped;
        if let Err(e) = self.state_machine.update_state(crate::state_machine::TaskPatch { status: Some(crate::domain::TaskStatus::Stopped), ..Default::default() }).await {
            warn!(%self.task_id, error = %e, "mark_stopped: state update failed");
        }
        self.publish_status("stopped", message).await;
    }

    pub async fn mark_completed(&self, message: impl Into<String>, result: Value) {
        let message = message.into();
        if let Err(e) = self
            .state_machine
            .update_state(crate::state_machine::TaskPatch {
                status: Some(crate::domain::TaskStatus::Completed),
                result: Some(result),
                ..Default::default()
            })
            .await
        {
            warn!(%self.task_id, error = %e, "mark_completed: state update failed");
        }
        self.publish_status("completed", message).await;
    }

    pub async fn mark_failed(&self, error: impl Into<String>) {
        let error = error.into();
        if let Err(e) = self
            .state_machine
            .update_state(crate::state_machine::TaskPatch {
                status: Some(crate::domain::TaskStatus::Failed),
                error: Some(error.clone()),
                ..Default::default()
            })
            .await
        {
            warn!(%self.task_id, error = %e, "mark_failed: state update failed");
        }
        self.publish_status("failed", error).await;
    }
}

fn step_name_for(plan: &StepPlan, step_index: usize) -> String {
    plan.steps.get(step_index).map(|s| s.name.clone()).unwrap_or_default()
}

fn step_desc_for(plan: &StepPlan, step_index: usize) -> String {
    plan.steps.get(step_index).map(|s| s.description.clone()).unwrap_or_default()
}
