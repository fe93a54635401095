//! Message broker publication

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

/// Error type for broker publication
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// Publishes a serialized payload to a topic with a routing key
#[async_trait]
pub trait QueuePublisher: Send + Sync + 'static {
    async fn publish(&self, topic: &str, routing_key: &str, payload: &str)
        -> Result<(), PublishError>;
}

/// Publisher used when no broker is configured; writes each message to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingQueuePublisher;

#[async_trait]
impl QueuePublisher for LoggingQueuePublisher {
    async fn publish(
        &self,
        topic: &str,
        routing_key: &str,
        payload: &str,
    ) -> Result<(), PublishError> {
        info!(topic, routing_key, payload, "published message");
        Ok(())
    }
}

/// A message captured by [`InMemoryQueuePublisher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub routing_key: String,
    pub payload: String,
}

/// Recording publisher for tests
///
/// Can be switched into a failing mode to exercise broker outages.
#[derive(Debug, Default)]
pub struct InMemoryQueuePublisher {
    published: Mutex<Vec<PublishedMessage>>,
    failing: AtomicBool,
}

impl InMemoryQueuePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Messages accepted so far, in publish order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl QueuePublisher for InMemoryQueuePublisher {
    async fn publish(
        &self,
        topic: &str,
        routing_key: &str,
        payload: &str,
    ) -> Result<(), PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Unavailable("broker offline".to_string()));
        }
        self.published.lock().push(PublishedMessage {
            topic: topic.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }
}
