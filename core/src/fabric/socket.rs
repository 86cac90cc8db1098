use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use super::{FabricMessage, MessageFabric, SubscriberFn};

/// Fan-out backend that forwards every published message to a single
/// externally-registered callback — the host process's own broadcast-socket
/// handler reaching whatever external subscribers exist beyond this
/// process. `subscribe`'s `topic` argument is ignored by this backend: the
/// registered callback receives every topic and is expected to filter.
pub struct BroadcastSocketFabric {
    callback: Mutex<Option<SubscriberFn>>,
    tx: mpsc::UnboundedSender<FabricMessage>,
}

impl BroadcastSocketFabric {
    pub fn new() -> std::sync::Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<FabricMessage>();
        let fabric = std::sync::Arc::new(Self {
            callback: Mutex::new(None),
            tx,
        });
        let weak = std::sync::Arc::downgrade(&fabric);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(fabric) = weak.upgrade() else { break };
                let cb = fabric.callback.lock().expect("callback lock poisoned").clone();
                if let Some(cb) = cb {
                    cb(message);
                }
            }
        });
        fabric
    }
}

#[async_trait]
impl MessageFabric for BroadcastSocketFabric {
    async fn connect(&self) -> bool {
        true
    }

    async fn disconnect(&self) {
        *self.callback.lock().expect("callback lock poisoned") = None;
    }

    async fn publish(&self, topic: &str, message: FabricMessage) -> bool {
        if self.tx.send(message).is_err() {
            warn!(%topic, "BroadcastSocketFabric::publish: fan-out task gone, dropping message");
            return false;
        }
        true
    }

    fn subscribe(&self, _topic: &str, callback: SubscriberFn) -> bool {
        *self.callback.lock().expect("callback lock poisoned") = Some(callback);
        true
    }

    fn unsubscribe(&self, _topic: &str) -> bool {
        let mut guard = self.callback.lock().expect("callback lock poisoned");
        let had_one = guard.is_some();
        *guard = None;
        had_one
    }

    fn is_connected(&self) -> bool {
        self.callback.lock().expect("callback lock poisoned").is_some()
    }
}
