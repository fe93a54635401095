//! Cross-worker coordination primitives
//!
//! This module provides:
//! - [`LockManager`] - time-bounded, token-checked leases on instances
//! - [`IdempotencyStore`] - first-writer-wins admission keys with expiry
//!
//! Both come in an in-memory flavor for tests and single-process runs, and a
//! PostgreSQL flavor sharing the engine's database.

mod idempotency;
mod lock;

pub use idempotency::{IdempotencyStore, InMemoryIdempotencyStore, PostgresIdempotencyStore};
pub use lock::{InMemoryLockManager, Lease, LockManager, PostgresLockManager};

/// Error type for coordination backends
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordinationError {
    /// Backend unavailable or query failed
    #[error("coordination backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for CoordinationError {
    fn from(e: sqlx::Error) -> Self {
        CoordinationError::Backend(e.to_string())
    }
}

/// Lease key for one workflow instance
pub fn instance_lock_key(instance_id: uuid::Uuid) -> String {
    format!("wf:{instance_id}")
}
