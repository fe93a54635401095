//! PostgreSQL implementation of WorkflowStore
//!
//! Production persistence with:
//! - A unique index on `(trigger_key, idempotency_key)` for exactly-once admission
//! - Optimistic concurrency on instances via `row_version`
//! - Checkpoints (instance, step attempt, dead letter, outbox rows) in one transaction

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::domain::{
    ContextMap, DeadLetterMessage, InstanceStatus, OutboxMessage, StepExecution, StepStatus,
    TriggerType, WorkflowDefinition, WorkflowInstance, WorkflowVersion,
};
use crate::dsl::StepKind;

/// PostgreSQL implementation of WorkflowStore
///
/// # Example
///
/// ```ignore
/// use stepflow_engine::PostgresWorkflowStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/stepflow").await?;
/// let store = PostgresWorkflowStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }
}

const INSTANCE_COLUMNS: &str = "id, definition_id, version_number, trigger_type, trigger_key, \
     idempotency_key, correlation_id, status, current_step_id, started_at, completed_at, \
     last_error, context, next_run_at, row_version";

const STEP_COLUMNS: &str = "id, instance_id, step_id, step_kind, status, attempt, started_at, \
     ended_at, duration_ms, input, output, error, next_run_at";

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self, definition, version), fields(definition_id = %definition.id))]
    async fn create_definition(
        &self,
        definition: &WorkflowDefinition,
        version: &WorkflowVersion,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_definitions (id, name, description, trigger_key, current_version, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(definition.id)
        .bind(&definition.name)
        .bind(&definition.description)
        .bind(&definition.trigger_key)
        .bind(definition.current_version)
        .bind(definition.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to create definition: {}", e);
            StoreError::Database(e.to_string())
        })?;

        insert_version(&mut tx, version).await?;

        tx.commit().await.map_err(db_error)?;
        debug!(name = %definition.name, "created workflow definition");
        Ok(())
    }

    #[instrument(skip(self, version), fields(definition_id = %version.definition_id))]
    async fn append_version(&self, version: &WorkflowVersion) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let row = sqlx::query(
            r#"
            SELECT current_version FROM workflow_definitions WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(version.definition_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::DefinitionNotFound(version.definition_id))?;

        let current: i32 = row.get("current_version");
        if current + 1 != version.version_number {
            return Err(StoreError::ConcurrencyConflict {
                id: version.definition_id,
                expected: i64::from(version.version_number - 1),
                actual: i64::from(current),
            });
        }

        insert_version(&mut tx, version).await?;

        sqlx::query(
            r#"
            UPDATE workflow_definitions SET current_version = $2 WHERE id = $1
            "#,
        )
        .bind(version.definition_id)
        .bind(version.version_number)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        debug!(version = version.version_number, "appended workflow version");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_definition(&self, id: Uuid) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, description, trigger_key, current_version, created_at
            FROM workflow_definitions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.as_ref().map(definition_from_row))
    }

    #[instrument(skip(self))]
    async fn find_definition_by_trigger(
        &self,
        trigger_key: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, description, trigger_key, current_version, created_at
            FROM workflow_definitions
            WHERE trigger_key = $1
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(trigger_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.as_ref().map(definition_from_row))
    }

    #[instrument(skip(self))]
    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, description, trigger_key, current_version, created_at
            FROM workflow_definitions
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.iter().map(definition_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn get_version(
        &self,
        definition_id: Uuid,
        version_number: i32,
    ) -> Result<Option<WorkflowVersion>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, definition_id, version_number, definition_json, content_hash, created_at
            FROM workflow_versions
            WHERE definition_id = $1 AND version_number = $2
            "#,
        )
        .bind(definition_id)
        .bind(version_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.as_ref().map(version_from_row))
    }

    #[instrument(skip(self))]
    async fn list_versions(
        &self,
        definition_id: Uuid,
    ) -> Result<Vec<WorkflowVersion>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, definition_id, version_number, definition_json, content_hash, created_at
            FROM workflow_versions
            WHERE definition_id = $1
            ORDER BY version_number
            "#,
        )
        .bind(definition_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.iter().map(version_from_row).collect())
    }

    #[instrument(skip(self, instance), fields(instance_id = %instance.id))]
    async fn insert_instance(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_instances (
                id, definition_id, version_number, trigger_type, trigger_key, idempotency_key,
                correlation_id, status, current_step_id, started_at, completed_at, last_error,
                context, next_run_at, row_version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(instance.id)
        .bind(instance.definition_id)
        .bind(instance.version_number)
        .bind(instance.trigger_type.as_str())
        .bind(&instance.trigger_key)
        .bind(&instance.idempotency_key)
        .bind(&instance.correlation_id)
        .bind(instance.status.as_str())
        .bind(&instance.current_step_id)
        .bind(instance.started_at)
        .bind(instance.completed_at)
        .bind(&instance.last_error)
        .bind(Value::Object(instance.context.clone()))
        .bind(instance.next_run_at)
        .bind(instance.row_version)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateInstance {
                    trigger_key: instance.trigger_key.clone(),
                    idempotency_key: instance.idempotency_key.clone(),
                }
            } else {
                error!("Failed to insert instance: {}", e);
                StoreError::Database(e.to_string())
            }
        })?;

        debug!("inserted workflow instance");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>, StoreError> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.as_ref().map(instance_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn find_instance_by_idempotency(
        &self,
        trigger_key: &str,
        idempotency_key: &str,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances \
             WHERE trigger_key = $1 AND idempotency_key = $2"
        );
        let row = sqlx::query(&sql)
            .bind(trigger_key)
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.as_ref().map(instance_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: usize,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances \
             WHERE ($1::text IS NULL OR status = $1) \
             ORDER BY started_at DESC NULLS LAST, id DESC \
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(status.map(|s| s.as_str()))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        rows.iter().map(instance_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn due_instances(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM workflow_instances
            WHERE status IN ('waiting', 'pending') AND next_run_at <= $1
            ORDER BY next_run_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    #[instrument(skip(self))]
    async fn stale_running_instances(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM workflow_instances
            WHERE status = 'running' AND started_at < $1
            ORDER BY started_at
            LIMIT $2
            "#,
        )
        .bind(started_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    #[instrument(skip(self))]
    async fn count_step_attempts(
        &self,
        instance_id: Uuid,
        step_id: &str,
    ) -> Result<u32, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS attempts FROM step_executions
            WHERE instance_id = $1 AND step_id = $2
            "#,
        )
        .bind(instance_id)
        .bind(step_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.get::<i64, _>("attempts") as u32)
    }

    #[instrument(skip(self))]
    async fn list_step_executions(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<StepExecution>, StoreError> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM step_executions \
             WHERE instance_id = $1 ORDER BY started_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(instance_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        rows.iter().map(step_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn latest_failed_step(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<StepExecution>, StoreError> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM step_executions \
             WHERE instance_id = $1 AND status = 'failed' \
             ORDER BY started_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.as_ref().map(step_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list_dead_letters(
        &self,
        instance_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<DeadLetterMessage>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, instance_id, reason, payload, failed_at
            FROM dead_letter_messages
            WHERE ($1::uuid IS NULL OR instance_id = $1)
            ORDER BY failed_at DESC
            LIMIT $2
            "#,
        )
        .bind(instance_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows
            .iter()
            .map(|r| DeadLetterMessage {
                id: r.get("id"),
                instance_id: r.get("instance_id"),
                reason: r.get("reason"),
                payload: r.get("payload"),
                failed_at: r.get("failed_at"),
            })
            .collect())
    }

    #[instrument(skip(self, checkpoint), fields(instance_id = %checkpoint.instance.id))]
    async fn commit(&self, checkpoint: Checkpoint<'_>) -> Result<i64, StoreError> {
        let instance = checkpoint.instance;
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let updated = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = $3,
                current_step_id = $4,
                started_at = $5,
                completed_at = $6,
                last_error = $7,
                context = $8,
                next_run_at = $9,
                row_version = row_version + 1
            WHERE id = $1 AND row_version = $2
            RETURNING row_version
            "#,
        )
        .bind(instance.id)
        .bind(instance.row_version)
        .bind(instance.status.as_str())
        .bind(&instance.current_step_id)
        .bind(instance.started_at)
        .bind(instance.completed_at)
        .bind(&instance.last_error)
        .bind(Value::Object(instance.context.clone()))
        .bind(instance.next_run_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to update instance: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let new_version: i64 = match updated {
            Some(row) => row.get("row_version"),
            None => {
                let actual = sqlx::query("SELECT row_version FROM workflow_instances WHERE id = $1")
                    .bind(instance.id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_error)?;
                return Err(match actual {
                    Some(row) => StoreError::ConcurrencyConflict {
                        id: instance.id,
                        expected: instance.row_version,
                        actual: row.get("row_version"),
                    },
                    None => StoreError::InstanceNotFound(instance.id),
                });
            }
        };

        if let Some(step) = checkpoint.step_execution {
            sqlx::query(
                r#"
                INSERT INTO step_executions (
                    id, instance_id, step_id, step_kind, status, attempt, started_at,
                    ended_at, duration_ms, input, output, error, next_run_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (id) DO UPDATE
                SET status = EXCLUDED.status,
                    started_at = EXCLUDED.started_at,
                    ended_at = EXCLUDED.ended_at,
                    duration_ms = EXCLUDED.duration_ms,
                    output = EXCLUDED.output,
                    error = EXCLUDED.error,
                    next_run_at = EXCLUDED.next_run_at
                "#,
            )
            .bind(step.id)
            .bind(step.instance_id)
            .bind(&step.step_id)
            .bind(step.step_kind.as_str())
            .bind(step.status.as_str())
            .bind(step.attempt as i32)
            .bind(step.started_at)
            .bind(step.ended_at)
            .bind(step.duration_ms)
            .bind(&step.input)
            .bind(&step.output)
            .bind(&step.error)
            .bind(step.next_run_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to upsert step execution: {}", e);
                StoreError::Database(e.to_string())
            })?;
        }

        if let Some(letter) = checkpoint.dead_letter {
            sqlx::query(
                r#"
                INSERT INTO dead_letter_messages (id, instance_id, reason, payload, failed_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(letter.id)
            .bind(letter.instance_id)
            .bind(&letter.reason)
            .bind(&letter.payload)
            .bind(letter.failed_at)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        for message in &checkpoint.outbox {
            sqlx::query(
                r#"
                INSERT INTO outbox_messages (id, message_type, payload, occurred_at, attempts)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(message.id)
            .bind(&message.message_type)
            .bind(&message.payload)
            .bind(message.occurred_at)
            .bind(message.attempts)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)?;

        debug!(new_version, events = checkpoint.outbox.len(), "committed checkpoint");
        Ok(new_version)
    }

    #[instrument(skip(self))]
    async fn pending_outbox(
        &self,
        max_attempts: i32,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, message_type, payload, occurred_at, published_at, attempts, last_error
            FROM outbox_messages
            WHERE published_at IS NULL AND attempts < $1
            ORDER BY occurred_at
            LIMIT $2
            "#,
        )
        .bind(max_attempts)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows
            .iter()
            .map(|r| OutboxMessage {
                id: r.get("id"),
                message_type: r.get("message_type"),
                payload: r.get("payload"),
                occurred_at: r.get("occurred_at"),
                published_at: r.get("published_at"),
                attempts: r.get("attempts"),
                last_error: r.get("last_error"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn mark_outbox_published(
        &self,
        id: Uuid,
        published_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE outbox_messages SET published_at = $2, last_error = NULL WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(published_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn mark_outbox_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE outbox_messages SET attempts = attempts + 1, last_error = $2 WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}

// Helper functions

async fn insert_version(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    version: &WorkflowVersion,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO workflow_versions (id, definition_id, version_number, definition_json, content_hash, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(version.id)
    .bind(version.definition_id)
    .bind(version.version_number)
    .bind(&version.definition_json)
    .bind(&version.content_hash)
    .bind(version.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        error!("Failed to insert version: {}", e);
        StoreError::Database(e.to_string())
    })?;
    Ok(())
}

fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn definition_from_row(row: &PgRow) -> WorkflowDefinition {
    WorkflowDefinition {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        trigger_key: row.get("trigger_key"),
        current_version: row.get("current_version"),
        created_at: row.get("created_at"),
    }
}

fn version_from_row(row: &PgRow) -> WorkflowVersion {
    WorkflowVersion {
        id: row.get("id"),
        definition_id: row.get("definition_id"),
        version_number: row.get("version_number"),
        definition_json: row.get("definition_json"),
        content_hash: row.get("content_hash"),
        created_at: row.get("created_at"),
    }
}

fn instance_from_row(row: &PgRow) -> Result<WorkflowInstance, StoreError> {
    let trigger_type: String = row.get("trigger_type");
    let status: String = row.get("status");
    let context: Value = row.get("context");

    Ok(WorkflowInstance {
        id: row.get("id"),
        definition_id: row.get("definition_id"),
        version_number: row.get("version_number"),
        trigger_type: TriggerType::parse(&trigger_type).ok_or_else(|| {
            StoreError::Serialization(format!("unknown trigger type: {trigger_type}"))
        })?,
        trigger_key: row.get("trigger_key"),
        idempotency_key: row.get("idempotency_key"),
        correlation_id: row.get("correlation_id"),
        status: InstanceStatus::parse(&status)
            .ok_or_else(|| StoreError::Serialization(format!("unknown instance status: {status}")))?,
        current_step_id: row.get("current_step_id"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        last_error: row.get("last_error"),
        context: match context {
            Value::Object(map) => map,
            _ => ContextMap::new(),
        },
        next_run_at: row.get("next_run_at"),
        row_version: row.get("row_version"),
    })
}

fn step_from_row(row: &PgRow) -> Result<StepExecution, StoreError> {
    let kind: String = row.get("step_kind");
    let status: String = row.get("status");

    Ok(StepExecution {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        step_id: row.get("step_id"),
        step_kind: StepKind::parse(&kind)
            .ok_or_else(|| StoreError::Serialization(format!("unknown step kind: {kind}")))?,
        status: StepStatus::parse(&status)
            .ok_or_else(|| StoreError::Serialization(format!("unknown step status: {status}")))?,
        attempt: row.get::<i32, _>("attempt") as u32,
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        duration_ms: row.get("duration_ms"),
        input: row.get("input"),
        output: row.get("output"),
        error: row.get("error"),
        next_run_at: row.get("next_run_at"),
    })
}
