use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, info};

use super::handle::{ControlHandle, checkpoint_path};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("task {0} is not registered with the control manager")]
    NotRegistered(String),
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Process-wide registry of [`ControlHandle`]s, one per in-flight task.
/// Mirrors `TaskControlManager`'s role: a single place the control-plane
/// API and the worker both consult so `pause`/`resume`/`stop` are visible
/// regardless of which routes handle them.
pub struct ControlManager {
    handles: Mutex<HashMap<String, ControlHandle>>,
    checkpoint_dir: PathBuf,
}

impl ControlManager {
    pub fn new(checkpoint_dir: PathBuf) -> Self {
        Self { handles: Mutex::new(HashMap::new()), checkpoint_dir }
    }

    /// Creates and stores a fresh handle for `task_id`, replacing any prior
    /// handle under the same id.
    pub fn register(&self, task_id: impl Into<String>) -> ControlHandle {
        let task_id = task_id.into();
        let handle = ControlHandle::new(task_id.clone(), self.checkpoint_dir.clone());
        self.handles.lock().expect("control manager lock poisoned").insert(task_id.clone(), handle.clone());
        debug!(%task_id, "ControlManager::register");
        handle
    }

    pub fn get(&self, task_id: &str) -> Option<ControlHandle> {
        self.handles.lock().expect("control manager lock poisoned").get(task_id).cloned()
    }

    pub fn unregister(&self, task_id: &str) {
        self.handles.lock().expect("control manager lock poisoned").remove(task_id);
        debug!(%task_id, "ControlManager::unregister");
    }

    pub fn pause(&self, task_id: &str) -> Result<bool, ControlError> {
        self.with_handle(task_id, |h| h.pause())
    }

    pub fn resume(&self, task_id: &str) -> Result<bool, ControlError> {
        self.with_handle(task_id, |h| h.resume())
    }

    pub fn stop(&self, task_id: &str) -> Result<bool, ControlError> {
        self.with_handle(task_id, |h| h.stop())
    }

    pub fn should_stop(&self, task_id: &str) -> Result<bool, ControlError> {
        self.with_handle(task_id, |h| h.should_stop())
    }

    pub fn should_pause(&self, task_id: &str) -> Result<bool, ControlError> {
        self.with_handle(task_id, |h| h.should_pause())
    }

    fn with_handle<T>(&self, task_id: &str, f: impl FnOnce(&ControlHandle) -> T) -> Result<T, ControlError> {
        let handles = self.handles.lock().expect("control manager lock poisoned");
        let handle = handles.get(task_id).ok_or_else(|| ControlError::NotRegistered(task_id.to_string()))?;
        Ok(f(handle))
    }

    /// Sweeps checkpoint files for tasks that are no longer registered and
    /// whose mtime is older than `older_than`. Bounds checkpoint retention:
    /// otherwise they accumulate forever for every task the process has
    /// ever run.
    pub fn gc_checkpoints(&self, older_than: Duration) -> Result<usize, ControlError> {
        let registered: std::collections::HashSet<String> =
            self.handles.lock().expect("control manager lock poisoned").keys().cloned().collect();

        let mut removed = 0;
        let entries = match std::fs::read_dir(&self.checkpoint_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(task_id) = task_id_from_checkpoint_path(&path) else { continue };
            if registered.contains(&task_id) {
                continue;
            }
            let metadata = entry.metadata()?;
            let age = metadata.modified().ok().and_then(|m| SystemTime::now().duration_since(m).ok()).unwrap_or_default();
            if age >= older_than {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        info!(removed, "ControlManager::gc_checkpoints");
        Ok(removed)
    }
}

fn task_id_from_checkpoint_path(path: &std::path::Path) -> Option<String> {
    let name = path.file_stem()?.to_str()?;
    name.strip_prefix("state_").map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_pause_resume_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = ControlManager::new(dir.path().to_path_buf());
        manager.register("t1");
        assert!(manager.pause("t1").unwrap());
        assert!(!manager.pause("t1").unwrap());
        assert!(manager.resume("t1").unwrap());
    }

    #[test]
    fn operations_on_unregistered_task_fail() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = ControlManager::new(dir.path().to_path_buf());
        assert!(matches!(manager.pause("ghost"), Err(ControlError::NotRegistered(_))));
    }

    #[test]
    fn unregister_forgets_handle() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = ControlManager::new(dir.path().to_path_buf());
        manager.register("t1");
        manager.unregister("t1");
        assert!(manager.get("t1").is_none());
    }

    #[test]
    fn gc_checkpoints_removes_only_unregistered_stale_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = ControlManager::new(dir.path().to_path_buf());
        let live = manager.register("live");
        live.save_checkpoint(&serde_json::json!({"task_id": "live"})).unwrap();

        let ghost_handle = ControlHandle::new("ghost", dir.path().to_path_buf());
        ghost_handle.save_checkpoint(&serde_json::json!({"task_id": "ghost"})).unwrap();

        let removed = manager.gc_checkpoints(Duration::from_secs(0)).unwrap();
        assert_eq!(removed, 1);
        assert!(checkpoint_path(dir.path(), "live").exists());
        assert!(!checkpoint_path(dir.path(), "ghost").exists());
    }
}
