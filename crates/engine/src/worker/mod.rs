//! Background processing
//!
//! This module provides:
//! - [`DispatchQueue`] - in-process queue of instance ids awaiting an executor
//! - [`Scheduler`] - re-enqueues due and stale instances
//! - [`OutboxRelay`] - publishes committed outbox rows
//! - [`WorkerPool`] - runs all of the above until shutdown

mod outbox;
mod pool;
mod queue;
mod scheduler;

pub use outbox::{OutboxRelay, RelayStats};
pub use pool::{WorkerPool, WorkerPoolError};
pub use queue::DispatchQueue;
pub use scheduler::Scheduler;
