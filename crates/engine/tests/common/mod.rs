//! Shared in-memory engine wiring for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use stepflow_engine::clock::{Clock, ManualClock};
use stepflow_engine::coordination::{InMemoryIdempotencyStore, InMemoryLockManager};
use stepflow_engine::domain::ContextMap;
use stepflow_engine::engine::{ExecutionOutcome, WorkflowExecutor, WorkflowService};
use stepflow_engine::handlers::{AiClient, EchoAiClient, HandlerError, HandlerRegistry};
use stepflow_engine::messaging::InMemoryQueuePublisher;
use stepflow_engine::persistence::InMemoryWorkflowStore;
use stepflow_engine::worker::{DispatchQueue, OutboxRelay, Scheduler};
use stepflow_engine::EngineConfig;
use tokio_util::sync::CancellationToken;

/// AI client that fails until healed
#[derive(Default)]
pub struct SwitchableAi {
    failing: AtomicBool,
}

impl SwitchableAi {
    pub fn failing() -> Self {
        Self {
            failing: AtomicBool::new(true),
        }
    }

    pub fn heal(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl AiClient for SwitchableAi {
    async fn complete(&self, provider: &str, model: &str, prompt: &str) -> Result<String, HandlerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(HandlerError::Ai("model overloaded".into()));
        }
        EchoAiClient.complete(provider, model, prompt).await
    }
}

pub struct Engine {
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryWorkflowStore>,
    pub publisher: Arc<InMemoryQueuePublisher>,
    pub queue: Arc<DispatchQueue>,
    pub executor: WorkflowExecutor,
    pub service: Arc<WorkflowService>,
    pub scheduler: Scheduler,
    pub relay: OutboxRelay,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_ai(Arc::new(EchoAiClient))
    }

    pub fn with_ai(ai: Arc<dyn AiClient>) -> Self {
        let config = EngineConfig::default();
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryWorkflowStore::new());
        let publisher = Arc::new(InMemoryQueuePublisher::new());
        let queue = Arc::new(DispatchQueue::new());
        let locks = Arc::new(InMemoryLockManager::with_clock(clock.clone()));

        let executor = WorkflowExecutor::new(
            store.clone(),
            locks.clone(),
            HandlerRegistry::standard(ai, publisher.clone()),
        )
        .with_clock(clock.clone())
        .with_config(&config);

        let service = WorkflowService::new(
            store.clone(),
            Arc::new(InMemoryIdempotencyStore::with_clock(clock.clone())),
            locks,
            queue.clone(),
        )
        .with_clock(clock.clone())
        .with_config(&config);

        let scheduler =
            Scheduler::new(store.clone(), queue.clone(), config.clone()).with_clock(clock.clone());
        let relay = OutboxRelay::new(store.clone(), publisher.clone(), config)
            .with_clock(clock.clone())
            .with_metrics(executor.metrics().clone());

        Self {
            clock,
            store,
            publisher,
            queue,
            executor,
            service: Arc::new(service),
            scheduler,
            relay,
        }
    }

    /// Define a workflow and admit one instance of it
    pub async fn start(&self, definition: Value, key: &str, context: Value) -> Uuid {
        let trigger_key = format!("flow-{key}");
        self.service
            .create_definition("flow", None, &trigger_key, &definition.to_string())
            .await
            .unwrap();
        self.service
            .start_by_trigger(&trigger_key, key, context_map(context), None)
            .await
            .unwrap()
    }

    /// Execute every queued id, like one pass of the worker loops
    pub async fn drain(&self) -> Vec<ExecutionOutcome> {
        let cancel = CancellationToken::new();
        let mut outcomes = Vec::new();
        while let Some(id) = self.queue.try_dequeue() {
            outcomes.push(self.executor.execute(id, &cancel).await.unwrap());
        }
        outcomes
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.clock.advance(by);
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}

pub fn context_map(value: Value) -> ContextMap {
    match value {
        Value::Object(map) => map,
        _ => ContextMap::new(),
    }
}
