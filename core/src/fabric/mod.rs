//! Pub/sub dissemination of progress and status messages.
//!
//! Three backends share one [`MessageFabric`] interface: [`InMemoryFabric`]
//! (in-process, broadcast-channel based — used for tests and the bundled
//! CLI), [`BroadcastSocketFabric`] (a single externally-registered
//! callback), and [`ExternalPubSubFabric`] (an abstract [`PubSubClient`]
//! with a background receive loop). `publish` never blocks the caller: it
//! enqueues onto an unbounded channel whose receiver drives the actual
//! fan-out on a dedicated task.

mod external;
mod in_memory;
mod message;
mod socket;

pub use external::{ExternalPubSubFabric, PubSubClient};
pub use in_memory::InMemoryFabric;
pub use message::{FabricMessage, SubscriberFn};
pub use socket::BroadcastSocketFabric;

use async_trait::async_trait;

pub const TOPIC_TASK_PROGRESS: &str = "task/progress";
pub const TOPIC_TASK_STATUS: &str = "task/status";
pub const TOPIC_MODULE_START: &str = "module/start";
pub const TOPIC_MODULE_COMPLETE: &str = "module/complete";
pub const TOPIC_MODULE_ERROR: &str = "module/error";

#[async_trait]
pub trait MessageFabric: Send + Sync {
    async fn connect(&self) -> bool;
    async fn disconnect(&self);
    /// Never blocks: enqueues and returns. Always `true` unless the fabric
    /// is disconnected or disabled (`fabric.enabled = false`).
    async fn publish(&self, topic: &str, message: FabricMessage) -> bool;
    fn subscribe(&self, topic: &str, callback: SubscriberFn) -> bool;
    fn unsubscribe(&self, topic: &str) -> bool;
    fn is_connected(&self) -> bool;
}

/// A no-op fabric for `fabric.enabled = false` (`[supplemented]` message-mode
/// toggle): publish is a no-op returning `true`, subscribe/unsubscribe are
/// no-ops, `is_connected` is always `false`.
pub struct DisabledFabric;

#[async_trait]
impl MessageFabric for DisabledFabric {
    async fn connect(&self) -> bool {
        false
    }

    async fn disconnect(&self) {}

    async fn publish(&self, _topic: &str, _message: FabricMessage) -> bool {
        true
    }

    fn subscribe(&self, _topic: &str, _callback: SubscriberFn) -> bool {
        false
    }

    fn unsubscribe(&self, _topic: &str) -> bool {
        false
    }

    fn is_connected(&self) -> bool {
        false
    }
}
