use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{FabricMessage, MessageFabric, SubscriberFn};

/// In-process dispatcher: a lock-protected per-topic subscriber list, with
/// `publish` decoupled from dispatch by an unbounded channel and a
/// dedicated fan-out task so the calling thread never blocks on subscriber
/// work.
pub struct InMemoryFabric {
    subscribers: Mutex<HashMap<String, Vec<SubscriberFn>>>,
    tx: mpsc::UnboundedSender<(String, FabricMessage)>,
}

impl InMemoryFabric {
    pub fn new() -> std::sync::Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, FabricMessage)>();
        let fabric = std::sync::Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            tx,
        });
        let weak = std::sync::Arc::downgrade(&fabric);
        tokio::spawn(async move {
            while let Some((topic, message)) = rx.recv().await {
                let Some(fabric) = weak.upgrade() else { break };
                fabric.dispatch(&topic, message);
            }
        });
        fabric
    }

    fn dispatch(&self, topic: &str, message: FabricMessage) {
        let callbacks: Vec<SubscriberFn> = {
            let subs = self.subscribers.lock().expect("subscriber lock poisoned");
            subs.get(topic).cloned().unwrap_or_default()
        };
        debug!(%topic, count = callbacks.len(), "InMemoryFabric::dispatch: delivering");
        for cb in callbacks {
            cb(message.clone());
        }
    }
}

#[async_trait]
impl MessageFabric for InMemoryFabric {
    async fn connect(&self) -> bool {
        true
    }

    async fn disconnect(&self) {
        self.subscribers.lock().expect("subscriber lock poisoned").clear();
    }

    async fn publish(&self, topic: &str, message: FabricMessage) -> bool {
        if self.tx.send((topic.to_string(), message)).is_err() {
            warn!(%topic, "InMemoryFabric::publish: fan-out task gone, dropping message");
            return false;
        }
        true
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StatusMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn subscriber_receives_published_message_in_order() {
        let fabric = InMemoryFabric::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        fabric.subscribe(
            "task/status",
            Arc::new(move |_msg| {
                seen_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        for i in 0..3 {
            fabric
                .publish(
                    "task/status",
                    FabricMessage::Status(StatusMessage {
                        analysis_id: "t1".into(),
                        status: "running".into(),
                        message: format!("step {i}"),
                        timestamp: i as f64,
                    }),
                )
                .await;
        }

        // publish is decoupled via an unbounded channel; yield so the
        // fan-out task drains it before asserting.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let fabric = InMemoryFabric::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        fabric.subscribe("task/status", Arc::new(move |_| { seen_cb.fetch_add(1, Ordering::SeqCst); }));
        assert!(fabric.unsubscribe("task/status"));

        fabric
            .publish(
                "task/status",
                FabricMessage::Status(StatusMessage {
                    analysis_id: "t1".into(),
                    status: "running".into(),
                    message: "x".into(),
                    timestamp: 0.0,
                }),
            )
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
