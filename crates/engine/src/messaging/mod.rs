//! Messaging collaborators
//!
//! This module provides:
//! - [`QueuePublisher`] - message broker used by queue-publish steps and the outbox relay
//! - [`EventBroadcaster`] - best-effort push of live updates to observers

mod broadcast;
mod publisher;

pub use broadcast::{BroadcastEvent, ChannelEventBroadcaster, EventBroadcaster, NullEventBroadcaster};
pub use publisher::{
    InMemoryQueuePublisher, LoggingQueuePublisher, PublishError, PublishedMessage, QueuePublisher,
};
