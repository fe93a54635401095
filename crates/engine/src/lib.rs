//! # Stepflow Execution Engine
//!
//! Runs declaratively defined, multi-step workflows (AI calls, HTTP calls,
//! conditional branches, timed delays, queue publications) with retries,
//! delayed resumption across restarts and at-least-once event delivery.
//!
//! ## Features
//!
//! - **Validated DSL**: JSON definitions compile into an acyclic step graph before anything is stored
//! - **Pinned versions**: instances keep running the version they were admitted with
//! - **Automatic retries**: per-step policies with exponential backoff and jitter, then a dead letter
//! - **Exactly one executor per instance**: ttl-bounded leases plus optimistic row versions
//! - **Idempotent admission**: one instance per `(trigger key, idempotency key)`
//! - **Transactional outbox**: events are committed with the state change and relayed later
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐  enqueue   ┌───────────────┐   dequeue   ┌─────────────┐
//! │   WorkflowService    │──────────▶│ DispatchQueue │────────────▶│ WorkerPool  │
//! │ (authoring, admission│            └───────────────┘             └──────┬──────┘
//! │  replay)             │                    ▲                            │
//! └──────────────────────┘                    │ due / stale                ▼
//!                                     ┌───────┴───────┐         ┌──────────────────┐
//!                                     │   Scheduler   │         │ WorkflowExecutor │
//!                                     └───────┬───────┘         │ (lease, handlers,│
//!                                             │                 │  checkpoints)    │
//!                                             ▼                 └────────┬─────────┘
//! ┌─────────────────────────────────────────────────────────────────────┴─────────┐
//! │                               WorkflowStore                                    │
//! │  definitions, versions, instances, step executions, dead letters, outbox       │
//! └──────────────────────────────────────┬─────────────────────────────────────────┘
//!                                        ▼
//!                                 ┌─────────────┐   publish   ┌────────────────┐
//!                                 │ OutboxRelay │────────────▶│ QueuePublisher │
//!                                 └─────────────┘             └────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use stepflow_engine::prelude::*;
//!
//! let store = Arc::new(InMemoryWorkflowStore::new());
//! let queue = Arc::new(DispatchQueue::new());
//! let service = WorkflowService::new(store.clone(), idempotency, locks.clone(), queue.clone());
//!
//! let definition = service
//!     .create_definition("triage", None, "ai-triage", DEFINITION_JSON)
//!     .await?;
//! let instance_id = service
//!     .start_by_trigger("ai-triage", "evt-1", context, None)
//!     .await?;
//! ```

pub mod clock;
pub mod condition;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod dsl;
pub mod engine;
pub mod handlers;
pub mod messaging;
pub mod observability;
pub mod persistence;
pub mod reliability;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::EngineConfig;
    pub use crate::coordination::{
        IdempotencyStore, InMemoryIdempotencyStore, InMemoryLockManager, LockManager,
        PostgresIdempotencyStore, PostgresLockManager,
    };
    pub use crate::domain::{
        ContextMap, InstanceStatus, StepExecution, StepStatus, TriggerType, WorkflowDefinition,
        WorkflowInstance,
    };
    pub use crate::dsl::{DslError, StepKind, WorkflowDsl};
    pub use crate::engine::{
        ExecutionOutcome, ExecutorError, ReplayMode, ServiceError, StartInstance,
        WorkflowExecutor, WorkflowService,
    };
    pub use crate::handlers::{AiClient, EchoAiClient, HandlerRegistry, StepHandler};
    pub use crate::messaging::{
        EventBroadcaster, InMemoryQueuePublisher, LoggingQueuePublisher, QueuePublisher,
    };
    pub use crate::observability::EngineMetrics;
    pub use crate::persistence::{
        InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowStore,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{DispatchQueue, OutboxRelay, Scheduler, WorkerPool};
    pub use std::sync::Arc;
    pub use tokio_util::sync::CancellationToken;
}

// Re-export key types at crate root
pub use config::EngineConfig;
pub use engine::{ExecutionOutcome, ExecutorError, WorkflowExecutor, WorkflowService};
pub use persistence::{InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowStore};
pub use reliability::RetryPolicy;
pub use worker::{DispatchQueue, WorkerPool};
