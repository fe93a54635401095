//! Live update broadcasting

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

/// An update pushed to observers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastEvent {
    pub name: String,
    pub payload: Value,
}

/// Best-effort, non-blocking fan-out of engine updates
///
/// Delivery failures are swallowed; observers that need every event read
/// the outbox instead.
pub trait EventBroadcaster: Send + Sync + 'static {
    fn broadcast(&self, name: &str, payload: Value);
}

/// Broadcaster that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventBroadcaster;

impl EventBroadcaster for NullEventBroadcaster {
    fn broadcast(&self, _name: &str, _payload: Value) {}
}

/// Broadcaster backed by a tokio broadcast channel
///
/// Slow subscribers lag and lose the oldest events rather than blocking the
/// engine.
#[derive(Debug, Clone)]
pub struct ChannelEventBroadcaster {
    sender: broadcast::Sender<BroadcastEvent>,
}

impl ChannelEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.sender.subscribe()
    }
}

impl Default for ChannelEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBroadcaster for ChannelEventBroadcaster {
    fn broadcast(&self, name: &str, payload: Value) {
        let event = BroadcastEvent {
            name: name.to_string(),
            payload,
        };
        if self.sender.send(event).is_err() {
            trace!(name, "no broadcast subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let broadcaster = ChannelEventBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();

        broadcaster.broadcast("stepStarted", json!({"stepId": "ai1"}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "stepStarted");
        assert_eq!(event.payload, json!({"stepId": "ai1"}));
    }

    #[test]
    fn test_broadcast_without_subscribers_is_harmless() {
        ChannelEventBroadcaster::default().broadcast("instanceUpdated", json!({}));
        NullEventBroadcaster.broadcast("instanceUpdated", json!({}));
    }
}
