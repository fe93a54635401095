//! Admission idempotency keys

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sqlx::PgPool;
use tracing::instrument;

use super::CoordinationError;
use crate::clock::{Clock, SystemClock};

/// Records the first sighting of a key for a bounded time
#[async_trait]
pub trait IdempotencyStore: Send + Sync + 'static {
    /// `true` for the first caller within `ttl`, `false` for everyone after
    async fn try_begin(&self, key: &str, ttl: Duration) -> Result<bool, CoordinationError>;
}

// =============================================================================
// In-memory
// =============================================================================

/// Process-local idempotency store
pub struct InMemoryIdempotencyStore {
    seen: DashMap<String, DateTime<Utc>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            seen: DashMap::new(),
            clock,
        }
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_begin(&self, key: &str, ttl: Duration) -> Result<bool, CoordinationError> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(36_500));
        let expires_at = now + ttl;

        match self.seen.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    return Ok(false);
                }
                entry.insert(expires_at);
            }
            Entry::Vacant(entry) => {
                entry.insert(expires_at);
            }
        }
        Ok(true)
    }
}

// =============================================================================
// PostgreSQL
// =============================================================================

/// Idempotency store backed by the `idempotency_keys` table
#[derive(Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    #[instrument(skip(self))]
    async fn try_begin(&self, key: &str, ttl: Duration) -> Result<bool, CoordinationError> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, expires_at)
            VALUES ($1, now() + make_interval(secs => $2))
            ON CONFLICT (key) DO UPDATE
            SET expires_at = EXCLUDED.expires_at
            WHERE idempotency_keys.expires_at <= now()
            "#,
        )
        .bind(key)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_only_first_caller_begins() {
        let store = InMemoryIdempotencyStore::new();
        let ttl = Duration::from_secs(6 * 3600);

        assert!(store.try_begin("ai-triage:req-1", ttl).await.unwrap());
        assert!(!store.try_begin("ai-triage:req-1", ttl).await.unwrap());
        assert!(store.try_begin("ai-triage:req-2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_key_is_reusable_after_expiry() {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryIdempotencyStore::with_clock(clock.clone());
        let ttl = Duration::from_secs(60);

        assert!(store.try_begin("k", ttl).await.unwrap());
        clock.advance(chrono::Duration::seconds(30));
        assert!(!store.try_begin("k", ttl).await.unwrap());
        clock.advance(chrono::Duration::seconds(31));
        assert!(store.try_begin("k", ttl).await.unwrap());
    }
}
