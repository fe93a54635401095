//! WorkflowStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    DeadLetterMessage, InstanceStatus, OutboxMessage, StepExecution, WorkflowDefinition,
    WorkflowInstance, WorkflowVersion,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Definition not found
    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(Uuid),

    /// Version not found
    #[error("workflow definition {definition_id} has no version {version}")]
    VersionNotFound { definition_id: Uuid, version: i32 },

    /// Instance not found
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Another instance already owns this (trigger key, idempotency key)
    #[error("instance already exists for {trigger_key}:{idempotency_key}")]
    DuplicateInstance {
        trigger_key: String,
        idempotency_key: String,
    },

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict on {id}: expected row version {expected}, got {actual}")]
    ConcurrencyConflict { id: Uuid, expected: i64, actual: i64 },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// State changes committed atomically after each step
///
/// The instance write is guarded by `instance.row_version`; every other row
/// in the checkpoint is only written when that guard passes, so an outbox
/// event exists if and only if its state transition committed.
#[derive(Debug)]
pub struct Checkpoint<'a> {
    pub instance: &'a WorkflowInstance,
    /// Inserted, or updated in place when the id already exists
    pub step_execution: Option<&'a StepExecution>,
    pub dead_letter: Option<&'a DeadLetterMessage>,
    pub outbox: Vec<OutboxMessage>,
}

impl<'a> Checkpoint<'a> {
    pub fn new(instance: &'a WorkflowInstance) -> Self {
        Self {
            instance,
            step_execution: None,
            dead_letter: None,
            outbox: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: &'a StepExecution) -> Self {
        self.step_execution = Some(step);
        self
    }

    pub fn with_dead_letter(mut self, dead_letter: &'a DeadLetterMessage) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = OutboxMessage>) -> Self {
        self.outbox.extend(events);
        self
    }
}

/// Persistence for definitions, instances, step attempts, dead letters and
/// the outbox
///
/// Implementations must enforce uniqueness of
/// `(trigger_key, idempotency_key)` across instances and optimistic
/// concurrency on instance writes.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Definitions
    // =========================================================================

    /// Insert a definition together with its first version
    async fn create_definition(
        &self,
        definition: &WorkflowDefinition,
        version: &WorkflowVersion,
    ) -> Result<(), StoreError>;

    /// Append a version and move the definition's current pointer to it
    ///
    /// Fails with `ConcurrencyConflict` unless `version.version_number` is
    /// exactly one past the current version.
    async fn append_version(&self, version: &WorkflowVersion) -> Result<(), StoreError>;

    async fn get_definition(&self, id: Uuid) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn find_definition_by_trigger(
        &self,
        trigger_key: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError>;

    async fn get_version(
        &self,
        definition_id: Uuid,
        version_number: i32,
    ) -> Result<Option<WorkflowVersion>, StoreError>;

    /// Versions ordered by version number
    async fn list_versions(&self, definition_id: Uuid)
        -> Result<Vec<WorkflowVersion>, StoreError>;

    // =========================================================================
    // Instances
    // =========================================================================

    /// Insert a new instance; `DuplicateInstance` when its keys are taken
    async fn insert_instance(&self, instance: &WorkflowInstance) -> Result<(), StoreError>;

    async fn get_instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>, StoreError>;

    async fn find_instance_by_idempotency(
        &self,
        trigger_key: &str,
        idempotency_key: &str,
    ) -> Result<Option<WorkflowInstance>, StoreError>;

    /// Most recently started first
    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: usize,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;

    /// Waiting or Pending instances whose `next_run_at` has passed
    async fn due_instances(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Running instances started before `started_before`
    async fn stale_running_instances(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError>;

    // =========================================================================
    // Step executions and dead letters
    // =========================================================================

    /// Number of attempts recorded for one step of one instance
    async fn count_step_attempts(&self, instance_id: Uuid, step_id: &str)
        -> Result<u32, StoreError>;

    /// Attempts ordered by start time
    async fn list_step_executions(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<StepExecution>, StoreError>;

    /// Most recently started attempt with status Failed
    async fn latest_failed_step(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<StepExecution>, StoreError>;

    /// Newest first; all instances when `instance_id` is `None`
    async fn list_dead_letters(
        &self,
        instance_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<DeadLetterMessage>, StoreError>;

    // =========================================================================
    // Checkpoints
    // =========================================================================

    /// Atomically persist a checkpoint, returning the instance's new row version
    async fn commit(&self, checkpoint: Checkpoint<'_>) -> Result<i64, StoreError>;

    // =========================================================================
    // Outbox
    // =========================================================================

    /// Unpublished rows with fewer than `max_attempts` failures, oldest first
    async fn pending_outbox(
        &self,
        max_attempts: i32,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, StoreError>;

    async fn mark_outbox_published(
        &self,
        id: Uuid,
        published_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Record a failed delivery and bump the attempt count
    async fn mark_outbox_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError>;
}
