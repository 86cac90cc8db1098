use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{FabricMessage, MessageFabric, SubscriberFn};

/// Abstract client for an external pub/sub service (redis pub/sub, mqtt,
/// a message broker — the concrete driver is out of scope). `receive` is
/// polled in a loop by `ExternalPubSubFabric`'s background task.
#[async_trait]
pub trait PubSubClient: Send + Sync {
    async fn connect(&self) -> bool;
    async fn disconnect(&self);
    async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> bool;
    /// Blocks until the next message arrives on any subscribed topic, or
    /// returns `None` when the client is disconnected / shutting down.
    async fn receive(&self) -> Option<(String, Vec<u8>)>;
    fn is_connected(&self) -> bool;
}

/// `MessageFabric` over an abstract `PubSubClient`, matching the "enqueue +
/// background fan-out" hot-path pattern: publish serializes and enqueues,
/// a dedicated task drains both the outgoing queue (to the client) and the
/// client's `receive` loop (dispatching to registered callbacks).
pub struct ExternalPubSubFabric {
    subscribers: Mutex<HashMap<String, Vec<SubscriberFn>>>,
    outgoing: mpsc::UnboundedSender<(String, FabricMessage)>,
}

impl ExternalPubSubFabric {
    pub fn spawn(client: std::sync::Arc<dyn PubSubClient>) -> std::sync::Arc<Self> {
        let (outgoing, mut out_rx) = mpsc::unbounded_channel::<(String, FabricMessage)>();
        let fabric = std::sync::Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            outgoing,
        });

        let publish_client = client.clone();
        tokio::spawn(async move {
            while let Some((topic, message)) = out_rx.recv().await {
                let Ok(payload) = encode(&message) else {
                    warn!(%topic, "ExternalPubSubFabric: failed to encode message, dropping");
                    continue;
                };
                if !publish_client.publish_raw(&topic, payload).await {
                    warn!(%topic, "ExternalPubSubFabric: publish_raw failed, dropping");
                }
            }
        });

        let weak = std::sync::Arc::downgrade(&fabric);
        tokio::spawn(async move {
            loop {
                let Some((topic, payload)) = client.receive().await else {
                    debug!("ExternalPubSubFabric: receive loop ended");
                    break;
                };
                let Some(fabric) = weak.upgrade() else { break };
                let Ok(message) = decode(&payload) else {
                    warn!(%topic, "ExternalPubSubFabric: failed to decode inbound message");
                    continue;
                };
                let callbacks: Vec<SubscriberFn> = {
                    let subs = fabric.subscribers.lock().expect("subscriber lock poisoned");
                    subs.get(&topic).cloned().unwrap_or_default()
                };
                for cb in callbacks {
                    cb(message.clone());
                }
            }
        });

        fabric
    }
}

fn encode(message: &FabricMessage) -> Result<Vec<u8>, serde_json::Error> {
    match message {
        FabricMessage::Progress(p) => serde_json::to_vec(p),
        FabricMessage::Status(s) => serde_json::to_vec(s),
    }
}

fn decode(payload: &[u8]) -> Result<FabricMessage, serde_json::Error> {
    if let Ok(p) = serde_json::from_slice::<crate::domain::ProgressMessage>(payload) {
        return Ok(FabricMessage::Progress(p));
    }
    serde_json::from_slice::<crate::domain::StatusMessage>(payload).map(FabricMessage::Status)
}

#[async_trait]
impl MessageFabric for ExternalPubSubFabric {
    async fn connect(&self) -> bool {
        true
    }

    async fn disconnect(&self) {
        self.subscribers.lock().expect("subscriber lock poisoned").clear();
    }

    async fn publish(&self, topic: &str, message: FabricMessage) -> bool {
        self.outgoing.send((topic.to_string(), message)).is_ok()
    }

    fn subscribe(&self, topic: &str, callback: SubscriberFn) -> bool {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .entry(topic.to_string())
            .or_default()
            .push(callback);
        true
    }

    fn unsubscribe(&self, topic: &str) -> bool {
        self.subscribers.lock().expect("subscriber lock poisoned").remove(topic).is_some()
    }

    fn is_connected(&self) -> bool {
        true
    }
}
