//! Instance leases

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sqlx::PgPool;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::CoordinationError;
use crate::clock::{Clock, SystemClock};

/// Proof of ownership of a lock key
///
/// Only the holder of the matching token can release the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub token: Uuid,
}

/// Mutual exclusion with expiry
///
/// A lease that is never released frees itself once its TTL elapses, so a
/// crashed holder cannot wedge an instance forever.
#[async_trait]
pub trait LockManager: Send + Sync + 'static {
    /// Take `key` for `ttl`; `None` when someone else holds an unexpired lease
    async fn try_acquire(&self, key: &str, ttl: Duration)
        -> Result<Option<Lease>, CoordinationError>;

    /// Release a lease; `false` when it had already expired or been taken over
    async fn release(&self, lease: &Lease) -> Result<bool, CoordinationError>;
}

// =============================================================================
// In-memory
// =============================================================================

struct Held {
    token: Uuid,
    expires_at: DateTime<Utc>,
}

/// Process-local lock manager
pub struct InMemoryLockManager {
    held: DashMap<String, Held>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            held: DashMap::new(),
            clock,
        }
    }
}

impl Default for InMemoryLockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, CoordinationError> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(36_500));
        let token = Uuid::now_v7();
        let fresh = Held {
            token,
            expires_at: now + ttl,
        };

        match self.held.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().expires_at > now {
                    return Ok(None);
                }
                entry.insert(fresh);
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh);
            }
        }

        Ok(Some(Lease {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, lease: &Lease) -> Result<bool, CoordinationError> {
        Ok(self
            .held
            .remove_if(&lease.key, |_, held| held.token == lease.token)
            .is_some())
    }
}

// =============================================================================
// PostgreSQL
// =============================================================================

/// Lock manager backed by the `leases` table
///
/// Expiry is judged by the database clock, so workers with skewed clocks
/// still agree on who holds a key.
#[derive(Clone)]
pub struct PostgresLockManager {
    pool: PgPool,
}

impl PostgresLockManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockManager for PostgresLockManager {
    #[instrument(skip(self))]
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, CoordinationError> {
        let token = Uuid::now_v7();
        let result = sqlx::query(
            r#"
            INSERT INTO leases (key, token, expires_at)
            VALUES ($1, $2, now() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
            SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
            WHERE leases.expires_at <= now()
            "#,
        )
        .bind(key)
        .bind(token)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            warn!("Failed to acquire lease: {}", e);
            CoordinationError::from(e)
        })?;

        if result.rows_affected() == 0 {
            debug!("lease held elsewhere");
            return Ok(None);
        }

        Ok(Some(Lease {
            key: key.to_string(),
            token,
        }))
    }

    #[instrument(skip(self, lease), fields(key = %lease.key))]
    async fn release(&self, lease: &Lease) -> Result<bool, CoordinationError> {
        let result = sqlx::query(
            r#"
            DELETE FROM leases WHERE key = $1 AND token = $2
            "#,
        )
        .bind(&lease.key)
        .bind(lease.token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
