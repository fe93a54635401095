//! Worker pool
//!
//! Owns the background loops of one engine process: `worker_count` worker
//! loops draining the dispatch queue, plus the scheduler and the outbox
//! relay. All of them share one cancellation token, which also reaches
//! in-flight handler calls through the executor.

use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{DispatchQueue, OutboxRelay, Scheduler};
use crate::config::EngineConfig;
use crate::engine::{ExecutionOutcome, WorkflowExecutor};

/// Error type for pool lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("background task panicked: {0}")]
    TaskPanicked(String),
}

/// Runs workers, scheduler and relay until shutdown
///
/// # Example
///
/// ```ignore
/// let pool = WorkerPool::new(executor, queue, scheduler, relay, config);
/// pool.start()?;
///
/// tokio::signal::ctrl_c().await?;
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    executor: Arc<WorkflowExecutor>,
    queue: Arc<DispatchQueue>,
    scheduler: Arc<Scheduler>,
    relay: Arc<OutboxRelay>,
    config: EngineConfig,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        executor: Arc<WorkflowExecutor>,
        queue: Arc<DispatchQueue>,
        scheduler: Arc<Scheduler>,
        relay: Arc<OutboxRelay>,
        config: EngineConfig,
    ) -> Self {
        Self {
            executor,
            queue,
            scheduler,
            relay,
            config,
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Token cancelled by [`WorkerPool::shutdown`]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.handles.lock().is_empty()
    }

    /// Spawn every background loop
    #[instrument(skip(self), fields(worker_count = self.config.worker_count))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return Err(WorkerPoolError::AlreadyRunning);
        }

        info!("Starting worker pool");

        for worker in 0..self.config.worker_count.max(1) {
            handles.push(self.start_worker_loop(worker));
        }

        let scheduler = Arc::clone(&self.scheduler);
        let cancel = self.cancel.clone();
        handles.push(tokio::spawn(async move { scheduler.run(cancel).await }));

        let relay = Arc::clone(&self.relay);
        let cancel = self.cancel.clone();
        handles.push(tokio::spawn(async move { relay.run(cancel).await }));

        Ok(())
    }

    fn start_worker_loop(&self, worker: usize) -> JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        let queue = Arc::clone(&self.queue);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            while let Some(instance_id) = queue.dequeue(&cancel).await {
                // Own task per dispatch so a panicking step cannot take the loop down
                let dispatch = {
                    let executor = Arc::clone(&executor);
                    let cancel = cancel.clone();
                    tokio::spawn(async move { executor.execute(instance_id, &cancel).await })
                };

                match dispatch.await {
                    Ok(Ok(ExecutionOutcome::Conflict)) => {
                        warn!(worker, %instance_id, "instance changed under the executor");
                    }
                    Ok(Ok(outcome)) => debug!(worker, %instance_id, ?outcome, "dispatch finished"),
                    Ok(Err(e)) => {
                        error!(worker, %instance_id, error = %e, "instance execution failed")
                    }
                    Err(e) if e.is_panic() => {
                        error!(worker, %instance_id, error = %e, "instance execution panicked")
                    }
                    Err(e) => error!(worker, %instance_id, error = %e, "dispatch task aborted"),
                }
            }

            debug!(worker, "Worker loop exited");
        })
    }

    /// Cancel every loop and wait for them to finish
    ///
    /// Steps interrupted mid-attempt resume from their last checkpoint on the
    /// next start.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        info!("Initiating graceful shutdown");
        self.cancel.cancel();

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        let mut panicked = None;
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "background task ended abnormally");
                panicked.get_or_insert_with(|| e.to_string());
            }
        }

        info!("Worker pool stopped");
        match panicked {
            Some(reason) => Err(WorkerPoolError::TaskPanicked(reason)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryLockManager;
    use crate::domain::{
        ContextMap, InstanceStatus, NewInstance, TriggerType, WorkflowDefinition,
        WorkflowInstance, WorkflowVersion,
    };
    use crate::dsl::StepKind;
    use crate::handlers::{
        EchoAiClient, HandlerError, HandlerRegistry, StepContext, StepHandler, StepResult,
    };
    use crate::messaging::InMemoryQueuePublisher;
    use crate::persistence::{InMemoryWorkflowStore, WorkflowStore};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;
    use uuid::Uuid;

    fn pool_on(
        store: Arc<InMemoryWorkflowStore>,
        queue: Arc<DispatchQueue>,
        registry: HandlerRegistry,
        workers: usize,
    ) -> WorkerPool {
        let publisher = Arc::new(InMemoryQueuePublisher::new());
        let config = EngineConfig::default().with_worker_count(workers);
        let executor = WorkflowExecutor::new(
            store.clone(),
            Arc::new(InMemoryLockManager::new()),
            registry,
        );
        WorkerPool::new(
            Arc::new(executor),
            queue.clone(),
            Arc::new(Scheduler::new(store.clone(), queue, config.clone())),
            Arc::new(OutboxRelay::new(store, publisher, config.clone())),
            config,
        )
    }

    fn pool() -> WorkerPool {
        let publisher = Arc::new(InMemoryQueuePublisher::new());
        pool_on(
            Arc::new(InMemoryWorkflowStore::new()),
            Arc::new(DispatchQueue::new()),
            HandlerRegistry::standard(Arc::new(EchoAiClient), publisher),
            2,
        )
    }

    async fn admit(store: &InMemoryWorkflowStore, key: &str, steps: serde_json::Value) -> Uuid {
        let now = Utc::now();
        let text = serde_json::json!({"name": key, "trigger": {"type": "manual"}, "steps": steps});
        let def = WorkflowDefinition::new(key, None, key, now);
        store
            .create_definition(&def, &WorkflowVersion::new(def.id, 1, text.to_string(), now))
            .await
            .unwrap();

        let instance = WorkflowInstance::new(
            NewInstance {
                definition_id: def.id,
                version_number: 1,
                trigger_type: TriggerType::Manual,
                trigger_key: key.into(),
                idempotency_key: key.into(),
                correlation_id: key.into(),
                context: ContextMap::new(),
            },
            now,
        );
        store.insert_instance(&instance).await.unwrap();
        instance.id
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let pool = pool();
        pool.start().unwrap();
        assert!(pool.is_running());
        assert!(matches!(pool.start(), Err(WorkerPoolError::AlreadyRunning)));

        pool.shutdown().await.unwrap();
        assert!(!pool.is_running());
        assert!(pool.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_panicking_step_does_not_stop_the_worker() {
        struct Exploding;

        #[async_trait]
        impl StepHandler for Exploding {
            fn kind(&self) -> StepKind {
                StepKind::Ai
            }

            async fn handle(
                &self,
                _ctx: StepContext<'_>,
                _cancel: CancellationToken,
            ) -> Result<StepResult, HandlerError> {
                panic!("handler blew up");
            }
        }

        let store = Arc::new(InMemoryWorkflowStore::new());
        let queue = Arc::new(DispatchQueue::new());
        let publisher = Arc::new(InMemoryQueuePublisher::new());
        let registry =
            HandlerRegistry::standard(Arc::new(EchoAiClient), publisher).with_handler(Exploding);

        let broken = admit(
            &store,
            "broken",
            serde_json::json!([{"id": "ai1", "type": "ai", "provider": "p", "model": "m",
                                "promptTemplate": "hi"}]),
        )
        .await;
        let healthy = admit(
            &store,
            "healthy",
            serde_json::json!([{"id": "q1", "type": "queue_publish", "topic": "t",
                                "routingKey": "k", "payloadTemplate": "{}"}]),
        )
        .await;
        queue.enqueue(broken);
        queue.enqueue(healthy);

        let pool = pool_on(store.clone(), queue, registry, 1);
        pool.start().unwrap();

        let mut status = InstanceStatus::Pending;
        for _ in 0..100 {
            status = store.get_instance(healthy).await.unwrap().unwrap().status;
            if status == InstanceStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, InstanceStatus::Completed);

        pool.shutdown().await.unwrap();
    }
}
