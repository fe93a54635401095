//! Persistence layer
//!
//! This module provides:
//! - [`WorkflowStore`] trait for definitions, instances, step attempts and the outbox
//! - [`InMemoryWorkflowStore`] for tests and single-process runs
//! - [`PostgresWorkflowStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowStore;
pub use postgres::PostgresWorkflowStore;
pub(crate) use postgres::is_unique_violation;
pub use store::{Checkpoint, StoreError, WorkflowStore};
