use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::{CacheLookupFilters, ResultReuseCache};
use crate::control::ControlHandle;
use crate::domain::NodeStatus;
use crate::progress::ProgressTracker;

use super::error::{AgentError, PipelineError};

/// The seam standing in for an out-of-scope agent implementation. A
/// concrete `AgentStage` performs one pipeline node's computation and
/// returns a shallow patch the worker merges into the accumulated task
/// result.
#[async_trait]
pub trait AgentStage: Send + Sync {
    fn module_name(&self) -> &str;
    async fn run(&self, state: Value, ctx: StageContext) -> Result<Value, AgentError>;
}

/// Context object passed to an `AgentStage`. Wraps per-task handles so an
/// agent can report progress, honor cancellation, and consult the
/// result-reuse cache without holding a reference to the whole worker.
#[derive(Clone)]
pub struct StageContext {
    step_index: usize,
    tracker: Arc<ProgressTracker>,
    control: ControlHandle,
    cache: Arc<ResultReuseCache>,
    ticker: String,
    trade_date: String,
    filters: CacheLookupFilters,
    poll_interval: Duration,
}

impl StageContext {
    pub fn new(
        step_index: usize,
        tracker: Arc<ProgressTracker>,
        control: ControlHandle,
        cache: Arc<ResultReuseCache>,
        ticker: String,
        trade_date: String,
        filters: CacheLookupFilters,
        poll_interval: Duration,
    ) -> Self {
        Self { step_index, tracker, control, cache, ticker, trade_date, filters, poll_interval }
    }

    /// Idempotent progress annotation: does not toggle step start/complete
    /// bookkeeping, just updates the last-message field.
    pub async fn update_progress(&self, message: impl Into<String>, step_index: usize) {
        self.tracker.update_from_message(step_index, None, NodeStatus::ToolCalling, message).await;
    }

    /// Returns immediately if running; blocks if paused; signals stop via
    /// `Err(PipelineError::Stopped)` if stop-latched. Agents are expected
    /// to call this at their own internal boundaries (between tool calls)
    /// so cancellation latency stays bounded.
    pub async fn check_control(&self) -> Result<(), PipelineError> {
        if self.control.should_stop() {
            return Err(PipelineError::Stopped);
        }
        self.control.wait_if_paused(self.poll_interval).await;
        if self.control.should_stop() {
            return Err(PipelineError::Stopped);
        }
        Ok(())
    }

    pub async fn cached_output(&self, node_name: &str) -> Option<Value> {
        self.cache.find_cached(&self.ticker, &self.trade_date, node_name, &self.filters).await.map(|entry| entry.output)
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }
}

/// Test double: after an artificial sleep, returns a fixed patch under its
/// module name. Exercises the worker loop, control protocol, and cache
/// splicing end to end without a real agent.
pub struct EchoAgentStage {
    module_name: String,
    delay: Duration,
    patch: Value,
}

impl EchoAgentStage {
    pub fn new(module_name: impl Into<String>, delay: Duration, patch: Value) -> Self {
        Self { module_name: module_name.into(), delay, patch }
    }
}

#[async_trait]
impl AgentStage for EchoAgentStage {
    fn module_name(&self) -> &str {
        &self.module_name
    }

    async fn run(&self, _state: Value, ctx: StageContext) -> Result<Value, AgentError> {
        tokio::time::sleep(self.delay).await;
        ctx.update_progress(format!("{} echoed", self.module_name), ctx.step_index()).await;
        Ok(self.patch.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlManager;
    use crate::progress::step_plan;
    use crate::state_machine::TaskStateMachineHandle;
    use orchestrator_store::LocalFileStore;
    use serde_json::json;
    use std::sync::Arc as StdArc;

    #[tokio::test]
    async fn echo_agent_returns_fixed_patch_after_delay() {
        let dir = tempfile::TempDir::new().unwrap();
        let store: StdArc<dyn orchestrator_store::StateStore> = StdArc::new(LocalFileStore::open(dir.path()).unwrap());
        let state_machine = TaskStateMachineHandle::spawn("t1", store.clone());
        let plan = step_plan::plan(&["market".to_string()], 1, crate::domain::MarketType::UsStock);
        let fabric: StdArc<dyn crate::fabric::MessageFabric> = crate::fabric::InMemoryFabric::new();
        let tracker = StdArc::new(ProgressTracker::new("t1", plan, state_machine, fabric, 60.0));
        let control_manager = ControlManager::new(dir.path().join("checkpoints"));
        let control = control_manager.register("t1");
        let cache = StdArc::new(ResultReuseCache::rebuild(store, Duration::from_millis(10)).await.unwrap());

        let ctx = StageContext::new(0, tracker, control, cache, "AAPL".into(), "2024-06-01".into(), CacheLookupFilters::default(), Duration::from_millis(10));

        let stage = EchoAgentStage::new("market_analyst", Duration::from_millis(5), json!({"market_report": "ok"}));
        let patch = stage.run(json!({}), ctx).await.unwrap();
        assert_eq!(patch, json!({"market_report": "ok"}));
    }
}
