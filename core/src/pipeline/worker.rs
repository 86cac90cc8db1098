use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::cache::{CacheLookupFilters, ResultReuseCache, splice};
use crate::control::ControlHandle;
use crate::domain::{AnalysisParams, NodeStatus, TaskStatus};
use crate::progress::{ProgressTracker, StepPlan};
use crate::state_machine::{TaskPatch, TaskStateMachineHandle};

use super::agent::{AgentStage, StageContext};
use super::error::AgentError;

/// How the worker exited its step loop; reaped by the `TaskManager`.
#[derive(Debug)]
pub enum WorkerOutcome {
    Completed { task_id: String },
    Failed { task_id: String, reason: String },
    Stopped { task_id: String },
}

/// Process-wide defaults threaded into every worker; per-task overrides
/// (cache sleep bounds) live on `AnalysisParams::cache_reuse_config`.
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub default_cache_sleep_min: f64,
    pub default_cache_sleep_max: f64,
}

/// Runs one task's pipeline to completion, checking pause/stop at every
/// step boundary before dispatching the next one.
pub async fn run_worker(
    task_id: String,
    params: AnalysisParams,
    plan: StepPlan,
    state_machine: TaskStateMachineHandle,
    tracker: Arc<ProgressTracker>,
    control: ControlHandle,
    cache: Arc<ResultReuseCache>,
    agents: Arc<HashMap<String, Arc<dyn AgentStage>>>,
    config: Arc<WorkerConfig>,
) -> WorkerOutcome {
    if let Err(e) = state_machine.update_state(TaskPatch { status: Some(TaskStatus::Running), ..Default::default() }).await {
        warn!(%task_id, error = %e, "run_worker: failed to mark task running, continuing anyway");
    }

    let cache_reuse = params.cache_reuse_config.clone().unwrap_or_default();
    let sleep_min = cache_reuse.sleep_min.unwrap_or(config.default_cache_sleep_min);
    let sleep_max = cache_reuse.sleep_max.unwrap_or(config.default_cache_sleep_max);
    let filters = CacheLookupFilters {
        research_depth: Some(params.research_depth),
        analysts: Some(params.analysts.clone()),
        market_type: Some(params.market_type),
    };
    let ticker = params.stock_symbol.clone();
    let trade_date = params.analysis_date.clone().unwrap_or_default();

    let mut state = json!({"analysis_id": task_id, "session_id": task_id});

    for step in &plan.steps {
        control.wait_if_paused(config.poll_interval).await;
        if control.should_stop() {
            return stop(&task_id, &tracker).await;
        }

        tracker.update_from_message(step.step_index, step.module_name.clone(), NodeStatus::Start, format!("{} started", step.name)).await;

        let Some(module_name) = step.module_name.clone() else {
            // Internal bookkeeping step (prep/post phases): no agent to invoke.
            tracker.update_from_message(step.step_index, None, NodeStatus::Complete, format!("{} complete", step.name)).await;
            continue;
        };

        let cache_hit = if cache_reuse.allows(&module_name) { cache.find_cached(&ticker, &trade_date, &module_name, &filters).await } else { None };

        let stage_result: Result<Value, AgentError> = match cache_hit {
            Some(entry) => {
                splice(&mut state, &entry);
                cache.emulate_cache_hit_delay(&control, sleep_min, sleep_max).await;
                if control.should_stop() {
                    return stop(&task_id, &tracker).await;
                }
                Ok(Value::Null)
            }
            None => match agents.get(&module_name) {
                Some(agent) => {
                    let ctx = StageContext::new(
                        step.step_index,
                        tracker.clone(),
                        control.clone(),
                        cache.clone(),
                        ticker.clone(),
                        trade_date.clone(),
                        filters.clone(),
                        config.poll_interval,
                    );
                    agent.run(state.clone(), ctx).await
                }
                None => Err(AgentError::recoverable(format!("no agent registered for {module_name}"))),
            },
        };

        match stage_result {
            Ok(patch) => {
                if let (Some(patch_obj), Some(state_obj)) = (patch.as_object(), state.as_object_mut()) {
                    for (k, v) in patch_obj {
                        state_obj.insert(k.clone(), v.clone());
                    }
                }
                tracker.update_from_message(step.step_index, Some(module_name.clone()), NodeStatus::Complete, format!("{} complete", step.name)).await;
            }
            Err(agent_err) => {
                tracker.update_from_message(step.step_index, Some(module_name.clone()), NodeStatus::Error, agent_err.message.clone()).await;
                if agent_err.recoverable {
                    if let Some(state_obj) = state.as_object_mut() {
                        state_obj.insert(format!("{module_name}_error"), Value::String(agent_err.message.clone()));
                    }
                    continue;
                }
                if let Err(e) = state_machine.update_state(TaskPatch { status: Some(TaskStatus::Failed), error: Some(agent_err.message.clone()), ..Default::default() }).await {
                    warn!(%task_id, error = %e, "run_worker: failed to persist FAILED status");
                }
                tracker.mark_failed(agent_err.message.clone()).await;
                return WorkerOutcome::Failed { task_id, reason: agent_err.message };
            }
        }
    }

    tracker.mark_completed("analysis complete", state.clone()).await;
    info!(%task_id, "run_worker: task completed");
    WorkerOutcome::Completed { task_id }
}

async fn stop(task_id: &str, tracker: &ProgressTracker) -> WorkerOutcome {
    tracker.mark_stopped("任务已被停止").await;
    WorkerOutcome::Stopped { task_id: task_id.to_string() }
}
