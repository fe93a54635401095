//! Execution engine
//!
//! - [`WorkflowExecutor`] - drives one instance through its steps under a lease
//! - [`WorkflowService`] - authoring, admission and replay
//! - [`events`] - outbox and broadcast event payloads

pub mod events;
mod executor;
mod service;

pub use executor::{ExecutionOutcome, ExecutorError, WorkflowExecutor};
pub use service::{ReplayMode, ServiceError, StartInstance, WorkflowService};
