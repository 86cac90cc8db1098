//! Local-filesystem `StateStore` backend.
//!
//! One JSON document per task for current state, one JSON array file per
//! task for history, both under `{base_dir}/task_states/`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fs2::FileExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{StateStore, StoreError, StoreKind};

/// One JSON document per task for current state, one JSON array file per
/// task for history. Writes to a given task's history file are serialized
/// by a per-task in-process lock.
pub struct LocalFileStore {
    base_dir: PathBuf,
    history_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LocalFileStore {
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(base_dir.join("task_states"))?;
        debug!(?base_dir, "LocalFileStore::open");
        Ok(Self {
            base_dir,
            history_locks: Mutex::new(HashMap::new()),
        })
    }

    fn current_path(&self, task_id: &str) -> PathBuf {
        self.base_dir.join("task_states").join(format!("{task_id}_current.json"))
    }

    fn history_path(&self, task_id: &str) -> PathBuf {
        self.base_dir.join("task_states").join(format!("{task_id}_history.json"))
    }

    async fn lock_for(&self, task_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.history_locks.lock().await;
        locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl StateStore for LocalFileStore {
    async fn save_current(&self, task_id: &str, state: &Value) -> Result<(), StoreError> {
        debug!(%task_id, "LocalFileStore::save_current");
        let path = self.current_path(task_id);
        let payload = serde_json::to_vec_pretty(state)?;
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &payload).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn load_current(&self, task_id: &str) -> Result<Option<Value>, StoreError> {
        debug!(%task_id, "LocalFileStore::load_current");
        let path = self.current_path(task_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                task_id: task_id.to_string(),
                reason: e.to_string(),
            })?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn append_history(&self, task_id: &str, state: &Value) -> Result<(), StoreError> {
        debug!(%task_id, "LocalFileStore::append_history");
        let task_lock = self.lock_for(task_id).await;
        let _guard = task_lock.lock().await;

        let path = self.history_path(task_id);
        let mut entries = read_history_file(&path)?;
        entries.push(state.clone());

        let payload = serde_json::to_vec_pretty(&entries)?;
        let tmp_path = path.with_extension("json.tmp");
        // Advisory exclusive lock for the read-modify-write, matching the
        // per-task serialization requirement even across a future multi-process
        // deployment of this backend.
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.lock_exclusive()?;
        {
            use std::io::Write;
            let mut f = &file;
            f.write_all(&payload)?;
        }
        FileExt::unlock(&file)?;
        drop(file);
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    async fn load_history(&self, task_id: &str) -> Result<Vec<Value>, StoreError> {
        debug!(%task_id, "LocalFileStore::load_history");
        let path = self.history_path(task_id);
        read_history_file(&path)
    }

    async fn list_task_ids(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.base_dir.join("task_states");
        let mut ids = Vec::new();
        let mut rd = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = rd.next_entry().await? {
            if let Some(name) = entry.file_name().to_str()
                && let Some(id) = name.strip_suffix("_current.json")
            {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    fn kind(&self) -> StoreKind {
        StoreKind::LocalFile
    }
}

fn read_history_file(path: &Path) -> Result<Vec<Value>, StoreError> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => {
            warn!(?path, error = %e, "read_history_file: failed");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn save_then_load_current_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = LocalFileStore::open(dir.path()).unwrap();

        assert!(store.load_current("t1").await.unwrap().is_none());

        let state = json!({"status": "RUNNING", "n": 1});
        store.save_current("t1", &state).await.unwrap();
        assert_eq!(store.load_current("t1").await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn append_history_accumulates_in_order() {
        let dir = TempDir::new().unwrap();
        let store = LocalFileStore::open(dir.path()).unwrap();

        for i in 0..3 {
            store.append_history("t1", &json!({"n": i})).await.unwrap();
        }

        let history = store.load_history("t1").await.unwrap();
        assert_eq!(history, vec![json!({"n": 0}), json!({"n": 1}), json!({"n": 2})]);
    }

    #[tokio::test]
    async fn list_task_ids_reflects_saved_current_documents() {
        let dir = TempDir::new().unwrap();
        let store = LocalFileStore::open(dir.path()).unwrap();

        store.save_current("a", &json!({})).await.unwrap();
        store.save_current("b", &json!({})).await.unwrap();

        let mut ids = store.list_task_ids().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn load_history_on_unknown_task_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = LocalFileStore::open(dir.path()).unwrap();
        assert_eq!(store.load_history("unknown").await.unwrap(), Vec::<Value>::new());
    }
}
