//! Due and stale instance sweeps

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::DispatchQueue;
use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, MIN_TICK_INTERVAL};
use crate::persistence::{StoreError, WorkflowStore};

/// Periodically re-enqueues instances that need an executor
///
/// Two sweeps per tick:
/// - Waiting or Pending instances whose `next_run_at` has passed
/// - Running instances started longer ago than the heartbeat timeout,
///   whose worker probably died mid-step
///
/// Ticks may run on several replicas at once; the instance lease makes the
/// duplicate dispatches harmless.
pub struct Scheduler {
    store: Arc<dyn WorkflowStore>,
    queue: Arc<DispatchQueue>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        queue: Arc<DispatchQueue>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run both sweeps once; returns how many ids were enqueued
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let batch = self.config.scheduler_batch_size;

        let due = self.store.due_instances(now, batch).await?;
        let heartbeat = chrono::Duration::from_std(self.config.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let stale = self
            .store
            .stale_running_instances(now - heartbeat, batch)
            .await?;

        if !stale.is_empty() {
            info!(count = stale.len(), "re-enqueueing stale running instances");
        }

        let total = due.len() + stale.len();
        for id in due.into_iter().chain(stale) {
            self.queue.enqueue(id);
        }
        Ok(total)
    }

    /// Tick every `scheduler_interval` until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.config.scheduler_interval.max(MIN_TICK_INTERVAL);
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "scheduler enqueued instances"),
                        Err(e) => error!(error = %e, "scheduler sweep failed"),
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }

        debug!("Scheduler loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::{
        ContextMap, NewInstance, TriggerType, WorkflowDefinition, WorkflowInstance,
        WorkflowVersion,
    };
    use crate::persistence::{Checkpoint, InMemoryWorkflowStore};
    use chrono::Duration;

    async fn insert(store: &InMemoryWorkflowStore, clock: &ManualClock, key: &str) -> WorkflowInstance {
        let now = clock.now();
        let def = WorkflowDefinition::new("s", None, key, now);
        let text = r#"{"name":"s","trigger":{"type":"manual"},"steps":[{"id":"d1","type":"delay"}]}"#;
        store
            .create_definition(&def, &WorkflowVersion::new(def.id, 1, text, now))
            .await
            .unwrap();
        let instance = WorkflowInstance::new(
            NewInstance {
                definition_id: def.id,
                version_number: 1,
                trigger_type: TriggerType::Manual,
                trigger_key: key.into(),
                idempotency_key: key.into(),
                correlation_id: "c".into(),
                context: ContextMap::new(),
            },
            now,
        );
        store.insert_instance(&instance).await.unwrap();
        instance
    }

    #[tokio::test]
    async fn test_tick_enqueues_due_and_stale() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryWorkflowStore::new());
        let queue = Arc::new(DispatchQueue::new());
        let scheduler = Scheduler::new(store.clone(), queue.clone(), EngineConfig::default())
            .with_clock(clock.clone());

        // Parked ten seconds out
        let mut waiting = insert(&store, &clock, "waiting").await;
        waiting.mark_waiting(clock.now() + Duration::seconds(10));
        store.commit(Checkpoint::new(&waiting)).await.unwrap();

        // Running, but its worker went away
        let mut running = insert(&store, &clock, "running").await;
        running.start(clock.now()).unwrap();
        store.commit(Checkpoint::new(&running)).await.unwrap();

        let pending = insert(&store, &clock, "pending").await;

        assert_eq!(scheduler.tick().await.unwrap(), 1);
        assert_eq!(queue.try_dequeue(), Some(pending.id));

        clock.advance(Duration::minutes(6));
        assert_eq!(scheduler.tick().await.unwrap(), 3);

        let mut drained = Vec::new();
        while let Some(id) = queue.try_dequeue() {
            drained.push(id);
        }
        assert!(drained.contains(&waiting.id));
        assert!(drained.contains(&running.id));
        assert!(drained.contains(&pending.id));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let scheduler = Scheduler::new(
            Arc::new(InMemoryWorkflowStore::new()),
            Arc::new(DispatchQueue::new()),
            EngineConfig::default(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        scheduler.run(cancel).await;
    }

    #[tokio::test]
    async fn test_zero_interval_still_ticks() {
        let mut config = EngineConfig::default();
        config.scheduler_interval = std::time::Duration::ZERO;
        let scheduler = Scheduler::new(
            Arc::new(InMemoryWorkflowStore::new()),
            Arc::new(DispatchQueue::new()),
            config,
        );

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            stop.cancel();
        });
        scheduler.run(cancel).await;
    }
}
