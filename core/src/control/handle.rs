use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Notify, watch};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    Running,
    Paused,
    Stopped,
}

/// Per-task control primitives. A stop latch (`Arc<AtomicBool>` plus a
/// `Notify` so waiters wake immediately rather than at the next poll tick),
/// a pause gate (`watch::Sender<bool>`/`Receiver`), and a task-state label.
/// Cloneable: the worker and the control-plane caller share the same
/// underlying primitives.
#[derive(Clone)]
pub struct ControlHandle {
    task_id: String,
    stop_latch: Arc<AtomicBool>,
    pause_tx: watch::Sender<bool>,
    pause_rx: watch::Receiver<bool>,
    notify: Arc<Notify>,
    label: Arc<StdMutex<Label>>,
    checkpoint_dir: PathBuf,
}

impl ControlHandle {
    pub(super) fn new(task_id: impl Into<String>, checkpoint_dir: PathBuf) -> Self {
        let (pause_tx, pause_rx) = watch::channel(false);
        Self {
            task_id: task_id.into(),
            stop_latch: Arc::new(AtomicBool::new(false)),
            pause_tx,
            pause_rx,
            notify: Arc::new(Notify::new()),
            label: Arc::new(StdMutex::new(Label::Running)),
            checkpoint_dir,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// If running, sets the pause gate. Rejects (returns `false`) if
    /// stopped or already paused.
    pub fn pause(&self) -> bool {
        let mut label = self.label.lock().expect("control label lock poisoned");
        if *label != Label::Running {
            debug!(task_id = %self.task_id, ?label, "ControlHandle::pause: rejected");
            return false;
        }
        *label = Label::Paused;
        let _ = self.pause_tx.send(true);
        self.persist_checkpoint_best_effort();
        true
    }

    /// If paused, clears the pause gate. Rejects if stopped or already running.
    pub fn resume(&self) -> bool {
        let mut label = self.label.lock().expect("control label lock poisoned");
        if *label != Label::Paused {
            debug!(task_id = %self.task_id, ?label, "ControlHandle::resume: rejected");
            return false;
        }
        *label = Label::Running;
        let _ = self.pause_tx.send(false);
        self.notify.notify_waiters();
        self.persist_checkpoint_best_effort();
        true
    }

    /// Idempotent: always leaves the task stopped. Clears the pause gate so
    /// any waiter unblocks immediately.
    pub fn stop(&self) -> bool {
        let mut label = self.label.lock().expect("control label lock poisoned");
        self.stop_latch.store(true, Ordering::SeqCst);
        let _ = self.pause_tx.send(false);
        *label = Label::Stopped;
        self.notify.notify_waiters();
        drop(label);
        self.persist_checkpoint_best_effort();
        true
    }

    pub fn should_stop(&self) -> bool {
        self.stop_latch.load(Ordering::SeqCst)
    }

    pub fn should_pause(&self) -> bool {
        !self.should_stop() && *self.pause_rx.borrow()
    }

    pub fn label(&self) -> &'static str {
        match *self.label.lock().expect("control label lock poisoned") {
            Label::Running => "running",
            Label::Paused => "paused",
            Label::Stopped => "stopped",
        }
    }

    /// Blocks while the pause gate is set and the stop latch is clear.
    /// Wakes immediately on `resume()`/`stop()` via `Notify`, falling back
    /// to `poll_interval` so a waiter that subscribes between a
    /// `notify_waiters()` call and this invocation isn't stuck indefinitely.
    pub async fn wait_if_paused(&self, poll_interval: Duration) {
        while self.should_pause() {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    pub fn save_checkpoint(&self, value: &Value) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.checkpoint_dir)?;
        let path = checkpoint_path(&self.checkpoint_dir, &self.task_id);
        let payload = serde_json::to_vec_pretty(value)?;
        std::fs::write(path, payload)
    }

    pub fn load_checkpoint(&self) -> Option<Value> {
        let path = checkpoint_path(&self.checkpoint_dir, &self.task_id);
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn persist_checkpoint_best_effort(&self) {
        let snapshot = serde_json::json!({ "task_id": self.task_id, "label": self.label() });
        if let Err(e) = self.save_checkpoint(&snapshot) {
            tracing::warn!(task_id = %self.task_id, error = %e, "ControlHandle: failed to persist checkpoint");
        }
    }
}

pub(super) fn checkpoint_path(dir: &Path, task_id: &str) -> PathBuf {
    dir.join(format!("state_{task_id}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pause_then_resume_unblocks_waiter() {
        let dir = tempfile::TempDir::new().unwrap();
        let handle = ControlHandle::new("t1", dir.path().to_path_buf());
        assert!(handle.pause());
        assert!(!handle.pause());

        let waiter = handle.clone();
        let task = tokio::spawn(async move {
            waiter.wait_if_paused(Duration::from_millis(50)).await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.resume());
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_unblocks_a_paused_waiter() {
        let dir = tempfile::TempDir::new().unwrap();
        let handle = ControlHandle::new("t1", dir.path().to_path_buf());
        handle.pause();
        let waiter = handle.clone();
        let task = tokio::spawn(async move {
            waiter.wait_if_paused(Duration::from_millis(50)).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(handle.should_stop());
    }

    #[test]
    fn stop_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let handle = ControlHandle::new("t1", dir.path().to_path_buf());
        assert!(handle.stop());
        assert!(handle.stop());
        assert_eq!(handle.label(), "stopped");
    }

    #[test]
    fn pause_rejected_once_stopped() {
        let dir = tempfile::TempDir::new().unwrap();
        let handle = ControlHandle::new("t1", dir.path().to_path_buf());
        handle.stop();
        assert!(!handle.pause());
    }

    #[test]
    fn checkpoint_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let handle = ControlHandle::new("t1", dir.path().to_path_buf());
        handle.save_checkpoint(&serde_json::json!({"k": "v"})).unwrap();
        assert_eq!(handle.load_checkpoint(), Some(serde_json::json!({"k": "v"})));
    }
}
