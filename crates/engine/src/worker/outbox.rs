//! Transactional outbox relay

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, MIN_TICK_INTERVAL};
use crate::messaging::QueuePublisher;
use crate::observability::EngineMetrics;
use crate::persistence::{StoreError, WorkflowStore};

const BASE_BACKOFF: Duration = Duration::from_millis(500);

/// Result of one relay pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub published: usize,
    pub failed: usize,
}

/// Publishes committed outbox rows to the broker
///
/// Delivery is at-least-once: a crash between publishing and marking the row
/// publishes it again on the next pass. Rows that keep failing stop being
/// picked up after `outbox_max_attempts`.
pub struct OutboxRelay {
    store: Arc<dyn WorkflowStore>,
    publisher: Arc<dyn QueuePublisher>,
    clock: Arc<dyn Clock>,
    metrics: Arc<EngineMetrics>,
    config: EngineConfig,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        publisher: Arc<dyn QueuePublisher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(EngineMetrics::new()),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Backoff after a row's `attempts`-th failed delivery
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exp = attempts.clamp(0, 16) as u32;
        BASE_BACKOFF
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.config.outbox_max_backoff)
    }

    /// Publish one batch of pending rows, oldest first
    #[instrument(skip(self, cancel))]
    pub async fn relay_once(&self, cancel: &CancellationToken) -> Result<RelayStats, StoreError> {
        let pending = self
            .store
            .pending_outbox(self.config.outbox_max_attempts, self.config.outbox_batch_size)
            .await?;

        let mut stats = RelayStats::default();
        for message in pending {
            if cancel.is_cancelled() {
                break;
            }

            let payload = message.payload.to_string();
            match self
                .publisher
                .publish(&self.config.outbox_topic, &message.message_type, &payload)
                .await
            {
                Ok(()) => {
                    self.store
                        .mark_outbox_published(message.id, self.clock.now())
                        .await?;
                    self.metrics.record_outbox_published();
                    stats.published += 1;
                }
                Err(e) => {
                    self.store
                        .mark_outbox_failed(message.id, &e.to_string())
                        .await?;
                    self.metrics.record_outbox_failed();
                    stats.failed += 1;

                    let delay = self.backoff(message.attempts + 1);
                    warn!(
                        message_id = %message.id,
                        message_type = %message.message_type,
                        attempts = message.attempts + 1,
                        error = %e,
                        ?delay,
                        "outbox publish failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }

        Ok(stats)
    }

    /// Relay every `outbox_interval` until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.config.outbox_interval.max(MIN_TICK_INTERVAL);
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.relay_once(&cancel).await {
                        Ok(stats) if stats.published + stats.failed > 0 => {
                            debug!(published = stats.published, failed = stats.failed, "outbox relayed");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "outbox relay failed"),
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }

        debug!("Outbox relay loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ContextMap, NewInstance, OutboxMessage, TriggerType, WorkflowDefinition,
        WorkflowInstance, WorkflowVersion,
    };
    use crate::messaging::InMemoryQueuePublisher;
    use crate::persistence::{Checkpoint, InMemoryWorkflowStore};
    use chrono::Utc;
    use serde_json::json;

    async fn store_with_events(events: Vec<OutboxMessage>) -> Arc<InMemoryWorkflowStore> {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let now = Utc::now();
        let def = WorkflowDefinition::new("o", None, "o", now);
        let text = r#"{"name":"o","trigger":{"type":"manual"},"steps":[{"id":"d1","type":"delay"}]}"#;
        store
            .create_definition(&def, &WorkflowVersion::new(def.id, 1, text, now))
            .await
            .unwrap();
        let instance = WorkflowInstance::new(
            NewInstance {
                definition_id: def.id,
                version_number: 1,
                trigger_type: TriggerType::Manual,
                trigger_key: "o".into(),
                idempotency_key: "o".into(),
                correlation_id: "c".into(),
                context: ContextMap::new(),
            },
            now,
        );
        store.insert_instance(&instance).await.unwrap();
        store
            .commit(Checkpoint::new(&instance).with_events(events))
            .await
            .unwrap();
        store
    }

    fn config() -> EngineConfig {
        EngineConfig::default().with_outbox_max_backoff(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_publishes_with_type_as_routing_key() {
        let now = Utc::now();
        let store = store_with_events(vec![
            OutboxMessage::new("WorkflowInstanceStarted", json!({"a": 1}), now),
            OutboxMessage::new("WorkflowCompleted", json!({"b": 2}), now),
        ])
        .await;
        let publisher = Arc::new(InMemoryQueuePublisher::new());
        let relay = OutboxRelay::new(store.clone(), publisher.clone(), config());

        let stats = relay.relay_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(stats, RelayStats { published: 2, failed: 0 });

        let sent = publisher.published();
        assert_eq!(sent[0].topic, "workflow.outbox");
        assert_eq!(sent[0].routing_key, "WorkflowInstanceStarted");
        assert_eq!(sent[1].payload, r#"{"b":2}"#);
        assert!(store.outbox_messages().iter().all(|m| m.is_published()));

        // Nothing left on the next pass
        let stats = relay.relay_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(stats, RelayStats::default());
    }

    #[tokio::test]
    async fn test_failures_are_counted_and_capped() {
        let store = store_with_events(vec![OutboxMessage::new("X", json!({}), Utc::now())]).await;
        let publisher = Arc::new(InMemoryQueuePublisher::new());
        publisher.set_failing(true);

        let mut cfg = config();
        cfg.outbox_max_attempts = 2;
        let relay = OutboxRelay::new(store.clone(), publisher.clone(), cfg);
        let cancel = CancellationToken::new();

        assert_eq!(relay.relay_once(&cancel).await.unwrap().failed, 1);
        assert_eq!(relay.relay_once(&cancel).await.unwrap().failed, 1);
        // Max attempts reached: the row is no longer picked up
        assert_eq!(relay.relay_once(&cancel).await.unwrap(), RelayStats::default());

        let row = &store.outbox_messages()[0];
        assert_eq!(row.attempts, 2);
        assert!(row.last_error.is_some());
        assert!(!row.is_published());
    }

    #[tokio::test]
    async fn test_backoff_is_capped() {
        let relay = OutboxRelay::new(
            Arc::new(InMemoryWorkflowStore::new()),
            Arc::new(InMemoryQueuePublisher::new()),
            EngineConfig::default(),
        );
        assert_eq!(relay.backoff(1), Duration::from_secs(1));
        assert_eq!(relay.backoff(3), Duration::from_secs(4));
        assert_eq!(relay.backoff(9), Duration::from_secs(30));
    }
}
