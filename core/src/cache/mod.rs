//! Result-reuse cache: locates a prior completed task's per-node output and
//! splices it into the live task state instead of re-running a pipeline
//! stage, when the per-task `cache_reuse_config` grants it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use tracing::{debug, info, warn};

use orchestrator_store::StateStore;

use crate::control::ControlHandle;
use crate::domain::{MarketType, TaskStatus};

/// Filters applied on top of the `(ticker, trade_date, node_name)` key:
/// a candidate task must match every `Some` field.
#[derive(Debug, Clone, Default)]
pub struct CacheLookupFilters {
    pub research_depth: Option<u8>,
    pub analysts: Option<Vec<String>>,
    pub market_type: Option<MarketType>,
}

/// A prior task's output for one pipeline node, accepted for reuse.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub node_name: String,
    pub source_task_id: String,
    pub output: Value,
}

#[derive(Debug, Clone)]
struct IndexedTask {
    task_id: String,
    updated_at: DateTime<Utc>,
    research_depth: u8,
    analysts: Vec<String>,
    market_type: MarketType,
    available_nodes: HashSet<String>,
}

impl IndexedTask {
    fn matches(&self, filters: &CacheLookupFilters) -> bool {
        if let Some(depth) = filters.research_depth
            && depth != self.research_depth
        {
            return false;
        }
        if let Some(market_type) = filters.market_type
            && market_type != self.market_type
        {
            return false;
        }
        if let Some(analysts) = &filters.analysts
            && analysts != &self.analysts
        {
            return false;
        }
        true
    }
}

/// Owns a secondary `(ticker, trade_date) -> candidates` index over the
/// `StateStore`'s completed-task documents; defines no storage format of
/// its own.
pub struct ResultReuseCache {
    store: Arc<dyn StateStore>,
    index: Mutex<HashMap<(String, String), Vec<IndexedTask>>>,
    poll_interval: Duration,
}

impl ResultReuseCache {
    /// Scans every task id in `store`, keeping completed tasks whose result
    /// document is a JSON object (one key per pipeline node). Mirrors the
    /// rebuild-index-on-boot pattern of the state store's own startup.
    pub async fn rebuild(store: Arc<dyn StateStore>, poll_interval: Duration) -> Result<Self, orchestrator_store::StoreError> {
        let mut index: HashMap<(String, String), Vec<IndexedTask>> = HashMap::new();
        let mut indexed_count = 0usize;

        for task_id in store.list_task_ids().await? {
            let Some(doc) = store.load_current(&task_id).await? else { continue };
            let Ok(task) = serde_json::from_value::<crate::domain::Task>(doc) else { continue };
            if task.status != TaskStatus::Completed {
                continue;
            }
            let Some(trade_date) = task.params.analysis_date.clone() else { continue };
            let Some(result_obj) = task.result.as_ref().and_then(Value::as_object) else { continue };

            let available_nodes: HashSet<String> = result_obj.keys().cloned().collect();
            index.entry((task.params.stock_symbol.clone(), trade_date)).or_default().push(IndexedTask {
                task_id: task.task_id,
                updated_at: task.updated_at,
                research_depth: task.params.research_depth,
                analysts: task.params.analysts,
                market_type: task.params.market_type,
                available_nodes,
            });
            indexed_count += 1;
        }

        info!(indexed_count, "ResultReuseCache::rebuild: index built");
        Ok(Self { store, index: Mutex::new(index), poll_interval })
    }

    /// Records a freshly-completed task in the index without a full rescan.
    pub fn index_completed_task(&self, task: &crate::domain::Task) {
        if task.status != TaskStatus::Completed {
            return;
        }
        let Some(trade_date) = task.params.analysis_date.clone() else { return };
        let Some(result_obj) = task.result.as_ref().and_then(Value::as_object) else { return };
        let available_nodes: HashSet<String> = result_obj.keys().cloned().collect();
        let entry = IndexedTask {
            task_id: task.task_id.clone(),
            updated_at: task.updated_at,
            research_depth: task.params.research_depth,
            analysts: task.params.analysts.clone(),
            market_type: task.params.market_type,
            available_nodes,
        };
        self.index.lock().expect("cache index lock poisoned").entry((task.params.stock_symbol.clone(), trade_date)).or_default().push(entry);
    }

    /// Consults the index for the most recently updated matching candidate
    /// that produced output for `node_name`, then loads its document to
    /// extract the node's output. Read-only against the document store.
    pub async fn find_cached(&self, ticker: &str, trade_date: &str, node_name: &str, filters: &CacheLookupFilters) -> Option<CacheEntry> {
        let best = {
            let index = self.index.lock().expect("cache index lock poisoned");
            let candidates = index.get(&(ticker.to_string(), trade_date.to_string()))?;
            candidates
                .iter()
                .filter(|c| c.available_nodes.contains(node_name))
                .filter(|c| c.matches(filters))
                .max_by_key(|c| c.updated_at)
                .cloned()
        }?;

        let doc = self.store.load_current(&best.task_id).await.ok()??;
        let output = doc.as_object()?.get(node_name)?.clone();
        debug!(%ticker, %trade_date, %node_name, source_task_id = %best.task_id, "ResultReuseCache::find_cached: hit");
        Some(CacheEntry { node_name: node_name.to_string(), source_task_id: best.task_id, output })
    }

    /// Sleeps a uniform-random duration in `[sleep_min, sleep_max]`,
    /// chunked by `poll_interval` so `should_stop`/`should_pause` stay
    /// responsive during the emulated delay. Returns early without
    /// completing the full duration if a stop is observed.
    pub async fn emulate_cache_hit_delay(&self, control: &ControlHandle, sleep_min: f64, sleep_max: f64) {
        let total_secs = if sleep_max > sleep_min {
            rand::rng().gen_range(sleep_min..sleep_max)
        } else {
            sleep_min.max(0.0)
        };
        let mut remaining = Duration::from_secs_f64(total_secs.max(0.0));

        while remaining > Duration::ZERO {
            if control.should_stop() {
                warn!(task_id = %control.task_id(), "emulate_cache_hit_delay: stopped mid-delay");
                return;
            }
            control.wait_if_paused(self.poll_interval).await;
            if control.should_stop() {
                return;
            }
            let chunk = remaining.min(self.poll_interval);
            tokio::time::sleep(chunk).await;
            remaining -= chunk;
        }
    }
}

/// Shallow-merges `entry.output`'s keys into `state`, preserving
/// `analysis_id`/`session_id` against being overwritten by cached data, and
/// bumping the relevant round counter for debate/risk-phase nodes so
/// loop-termination logic downstream stays consistent.
pub fn splice(state: &mut Value, entry: &CacheEntry) {
    let Some(state_obj) = state.as_object_mut() else {
        *state = entry.output.clone();
        return;
    };

    match entry.output.as_object() {
        Some(output_obj) => {
            let preserved_analysis_id = state_obj.get("analysis_id").cloned();
            let preserved_session_id = state_obj.get("session_id").cloned();
            for (k, v) in output_obj {
                state_obj.insert(k.clone(), v.clone());
            }
            if let Some(v) = preserved_analysis_id {
                state_obj.insert("analysis_id".to_string(), v);
            }
            if let Some(v) = preserved_session_id {
                state_obj.insert("session_id".to_string(), v);
            }
        }
        None => {
            state_obj.insert(entry.node_name.clone(), entry.output.clone());
        }
    }

    match entry.node_name.as_str() {
        "bull_researcher" | "bear_researcher" => bump_round_counter(state_obj, "investment_debate_state"),
        "risky_analyst" | "safe_analyst" | "neutral_analyst" => bump_round_counter(state_obj, "risk_debate_state"),
        _ => {}
    }
}

fn bump_round_counter(state_obj: &mut serde_json::Map<String, Value>, key: &str) {
    if let Some(Value::Object(phase_state)) = state_obj.get_mut(key) {
        let count = phase_state.get("count").and_then(Value::as_i64).unwrap_or(0);
        phase_state.insert("count".to_string(), Value::from(count + 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_store::LocalFileStore;
    use serde_json::json;

    async fn seed_completed_task(store: &LocalFileStore, task_id: &str, symbol: &str, date: &str, result: Value) {
        let doc = json!({
            "task_id": task_id,
            "status": "completed",
            "created_at": Utc::now(),
            "updated_at": Utc::now(),
            "params": {
                "stock_symbol": symbol,
                "market_type": "A股",
                "analysis_date": date,
                "analysts": ["market"],
                "research_depth": 2,
                "include_sentiment": false,
                "include_risk_assessment": false,
                "custom_prompt": null,
                "extra_config": null,
                "cache_reuse_config": null,
            },
            "progress": {"current_step": 0, "total_steps": 1, "percentage": 1.0, "message": "", "analysis_start_time": 0.0},
            "current_step": null,
            "result": result,
            "error": null,
            "cache_reuse_config": null,
            "checkpoint": null,
        });
        store.save_current(task_id, &doc).await.unwrap();
    }

    #[tokio::test]
    async fn find_cached_returns_matching_node_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LocalFileStore::open(dir.path()).unwrap();
        seed_completed_task(&store, "t1", "AAPL", "2026-01-01", json!({"market_analyst": {"report": "bullish"}})).await;

        let cache = ResultReuseCache::rebuild(Arc::new(store), Duration::from_millis(10)).await.unwrap();
        let filters = CacheLookupFilters { research_depth: Some(2), ..Default::default() };
        let entry = cache.find_cached("AAPL", "2026-01-01", "market_analyst", &filters).await.unwrap();
        assert_eq!(entry.output, json!({"report": "bullish"}));
    }

    #[tokio::test]
    async fn find_cached_rejects_mismatched_filter() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LocalFileStore::open(dir.path()).unwrap();
        seed_completed_task(&store, "t1", "AAPL", "2026-01-01", json!({"market_analyst": {"report": "bullish"}})).await;

        let cache = ResultReuseCache::rebuild(Arc::new(store), Duration::from_millis(10)).await.unwrap();
        let filters = CacheLookupFilters { research_depth: Some(3), ..Default::default() };
        assert!(cache.find_cached("AAPL", "2026-01-01", "market_analyst", &filters).await.is_none());
    }

    #[tokio::test]
    async fn find_cached_misses_unknown_node() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LocalFileStore::open(dir.path()).unwrap();
        seed_completed_task(&store, "t1", "AAPL", "2026-01-01", json!({"market_analyst": {}})).await;

        let cache = ResultReuseCache::rebuild(Arc::new(store), Duration::from_millis(10)).await.unwrap();
        assert!(cache.find_cached("AAPL", "2026-01-01", "bull_researcher", &Default::default()).await.is_none());
    }

    #[test]
    fn splice_preserves_analysis_id_and_bumps_debate_round() {
        let mut state = json!({
            "analysis_id": "live-task",
            "investment_debate_state": {"count": 1},
        });
        let entry = CacheEntry {
            node_name: "bull_researcher".to_string(),
            source_task_id: "cached-task".to_string(),
            output: json!({"analysis_id": "cached-task", "bull_argument": "buy"}),
        };
        splice(&mut state, &entry);
        assert_eq!(state["analysis_id"], json!("live-task"));
        assert_eq!(state["bull_argument"], json!("buy"));
        assert_eq!(state["investment_debate_state"]["count"], json!(2));
    }

    #[tokio::test]
    async fn emulated_delay_returns_early_on_stop() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LocalFileStore::open(dir.path()).unwrap();
        let cache = ResultReuseCache::rebuild(Arc::new(store), Duration::from_millis(20)).await.unwrap();
        let manager = crate::control::ControlManager::new(dir.path().join("checkpoints"));
        let control = manager.register("t1");
        control.stop();

        let started = std::time::Instant::now();
        cache.emulate_cache_hit_delay(&control, 5.0, 5.0).await;
        assert!(started.elapsed() < Duration::from_millis(200));
    }
}
