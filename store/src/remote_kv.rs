//! Remote key-value `StateStore` backend, and the fallback composer.
//!
//! The concrete network driver for a real KV service (redis, etcd, whatever
//! the deployment picks) is out of scope; [`KvClient`] is the seam a real
//! driver plugs into. [`InMemoryKvClient`] exercises the code path in tests.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, warn};

use crate::{StateStore, StoreError, StoreKind};

/// Abstract network client for a key-value service. A concrete implementation
/// (redis, etcd, ...) is out of scope for this crate.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    async fn list_push(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    async fn list_all(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError>;
    async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    /// Probed once at `RemoteKvStore::connect` time; a failure here is what
    /// triggers `FallbackStore`'s fallback-to-local behavior.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Test double standing in for a real network-backed `KvClient`.
#[derive(Default)]
pub struct InMemoryKvClient {
    values: tokio::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
    lists: tokio::sync::Mutex<std::collections::HashMap<String, Vec<Vec<u8>>>>,
    /// When set, `ping` fails, simulating an unreachable service.
    pub fail_ping: bool,
}

impl InMemoryKvClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable() -> Self {
        Self {
            fail_ping: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl KvClient for InMemoryKvClient {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.values.lock().await.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn list_push(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.lists.lock().await.entry(key.to_string()).or_default().push(value.to_vec());
        Ok(())
    }

    async fn list_all(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self.lists.lock().await.get(key).cloned().unwrap_or_default())
    }

    async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let values = self.values.lock().await;
        Ok(values.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.fail_ping {
            return Err(StoreError::Unavailable("in-memory kv client simulated outage".into()));
        }
        Ok(())
    }
}

fn current_key(task_id: &str) -> String {
    format!("task:{task_id}:current")
}

fn history_key(task_id: &str) -> String {
    format!("task:{task_id}:history")
}

/// `StateStore` over an abstract [`KvClient`].
pub struct RemoteKvStore<C: KvClient> {
    client: C,
}

impl<C: KvClient> RemoteKvStore<C> {
    /// Probes `client.ping()` and returns an error if the service is
    /// unreachable; callers that want fallback-on-failure should use
    /// [`FallbackStore::connect`] instead of this directly.
    pub async fn connect(client: C) -> Result<Self, StoreError> {
        client.ping().await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl<C: KvClient> StateStore for RemoteKvStore<C> {
    async fn save_current(&self, task_id: &str, state: &Value) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(state)?;
        self.client.set(&current_key(task_id), &payload).await
    }

    async fn load_current(&self, task_id: &str) -> Result<Option<Value>, StoreError> {
        match self.client.get(&current_key(task_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                task_id: task_id.to_string(),
                reason: e.to_string(),
            })?)),
            None => Ok(None),
        }
    }

    async fn append_history(&self, task_id: &str, state: &Value) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(state)?;
        self.client.list_push(&history_key(task_id), &payload).await
    }

    async fn load_history(&self, task_id: &str) -> Result<Vec<Value>, StoreError> {
        let raw = self.client.list_all(&history_key(task_id)).await?;
        raw.iter().map(|bytes| serde_json::from_slice(bytes).map_err(StoreError::from)).collect()
    }

    async fn list_task_ids(&self) -> Result<Vec<String>, StoreError> {
        let keys = self.client.list_keys_with_prefix("task:").await?;
        let ids = keys
            .into_iter()
            .filter_map(|k| k.strip_prefix("task:").and_then(|rest| rest.strip_suffix(":current")).map(str::to_string))
            .collect();
        Ok(ids)
    }

    fn kind(&self) -> StoreKind {
        StoreKind::RemoteKv
    }
}

/// Composes a remote and a local backend: if connecting the remote backend
/// fails, logs a warning and falls back to the local backend for the process
/// lifetime. The configured backend choice (remote) is never silently
/// retried mid-run; the fallback decision is made once, at startup.
pub struct FallbackStore {
    inner: Box<dyn StateStore>,
    kind: StoreKind,
}

impl FallbackStore {
    pub async fn connect<C: KvClient + 'static>(client: C, local: LocalFileStoreFactory<'_>) -> Result<Self, StoreError> {
        match RemoteKvStore::connect(client).await {
            Ok(remote) => Ok(Self {
                inner: Box::new(remote),
                kind: StoreKind::RemoteKv,
            }),
            Err(e) => {
                warn!(error = %e, "FallbackStore: remote kv backend unreachable, falling back to local file store");
                let local = local.build().map_err(|e| {
                    error!(error = %e, "FallbackStore: local fallback also failed to open");
                    e
                })?;
                Ok(Self {
                    inner: Box::new(local),
                    kind: StoreKind::RemoteKvFallenBack,
                })
            }
        }
    }
}

/// Deferred local-store construction, so `FallbackStore::connect` only pays
/// the cost of opening the local backend when the remote one fails.
pub struct LocalFileStoreFactory<'a> {
    base_dir: &'a std::path::Path,
}

impl<'a> LocalFileStoreFactory<'a> {
    pub fn new(base_dir: &'a std::path::Path) -> Self {
        Self { base_dir }
    }

    fn build(self) -> Result<crate::LocalFileStore, StoreError> {
        crate::LocalFileStore::open(self.base_dir)
    }
}

#[async_trait]
impl StateStore for FallbackStore {
    async fn save_current(&self, task_id: &str, state: &Value) -> Result<(), StoreError> {
        self.inner.save_current(task_id, state).await
    }

    async fn load_current(&self, task_id: &str) -> Result<Option<Value>, StoreError> {
        self.inner.load_current(task_id).await
    }

    async fn append_history(&self, task_id: &str, state: &Value) -> Result<(), StoreError> {
        self.inner.append_history(task_id, state).await
    }

    async fn load_history(&self, task_id: &str) -> Result<Vec<Value>, StoreError> {
        self.inner.load_history(task_id).await
    }

    async fn list_task_ids(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_task_ids().await
    }

    fn kind(&self) -> StoreKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn remote_store_round_trips_current_and_history() {
        let client = InMemoryKvClient::new();
        let store = RemoteKvStore::connect(client).await.unwrap();

        store.save_current("t1", &json!({"n": 1})).await.unwrap();
        assert_eq!(store.load_current("t1").await.unwrap(), Some(json!({"n": 1})));

        store.append_history("t1", &json!({"step": 0})).await.unwrap();
        store.append_history("t1", &json!({"step": 1})).await.unwrap();
        assert_eq!(store.load_history("t1").await.unwrap(), vec![json!({"step": 0}), json!({"step": 1})]);
    }

    #[tokio::test]
    async fn connect_fails_fast_when_client_unreachable() {
        let client = InMemoryKvClient::unreachable();
        let err = RemoteKvStore::connect(client).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn fallback_store_falls_back_to_local_on_unreachable_remote() {
        let dir = tempfile::TempDir::new().unwrap();
        let client = InMemoryKvClient::unreachable();
        let store = FallbackStore::connect(client, LocalFileStoreFactory::new(dir.path())).await.unwrap();

        assert_eq!(store.kind(), StoreKind::RemoteKvFallenBack);
        store.save_current("t1", &json!({"ok": true})).await.unwrap();
        assert_eq!(store.load_current("t1").await.unwrap(), Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn fallback_store_uses_remote_when_reachable() {
        let dir = tempfile::TempDir::new().unwrap();
        let client = InMemoryKvClient::new();
        let store = FallbackStore::connect(client, LocalFileStoreFactory::new(dir.path())).await.unwrap();
        assert_eq!(store.kind(), StoreKind::RemoteKv);
    }
}
