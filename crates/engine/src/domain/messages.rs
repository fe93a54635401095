//! Dead letters and outbox rows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Terminal failure snapshot of an instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterMessage {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub reason: String,
    /// Instance context at the time of failure
    pub payload: Value,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterMessage {
    pub fn new(
        instance_id: Uuid,
        reason: impl Into<String>,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            reason: reason.into(),
            payload,
            failed_at: now,
        }
    }
}

/// Domain event staged for relay to the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxMessage {
    pub id: Uuid,
    /// Event type; also used as the routing key
    pub message_type: String,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
}

impl OutboxMessage {
    pub fn new(message_type: impl Into<String>, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            message_type: message_type.into(),
            payload,
            occurred_at: now,
            published_at: None,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }
}
