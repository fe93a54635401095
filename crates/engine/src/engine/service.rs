//! Authoring, admission and replay
//!
//! `WorkflowService` is the surface an HTTP layer calls into. It never runs
//! steps itself: admission and replay persist the instance and hand its id
//! to the [`DispatchQueue`], where worker loops pick it up.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::coordination::{instance_lock_key, CoordinationError, IdempotencyStore, LockManager};
use crate::domain::{
    ContextMap, DeadLetterMessage, InstanceError, NewInstance, StepExecution, TriggerType,
    WorkflowDefinition, WorkflowInstance, WorkflowVersion,
};
use crate::dsl::{self, DslError, WorkflowDsl};
use crate::persistence::{Checkpoint, StoreError, WorkflowStore};
use crate::worker::DispatchQueue;

/// Errors returned to callers of [`WorkflowService`]
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(Uuid),

    #[error("no workflow definition has trigger key {0}")]
    UnknownTrigger(String),

    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error(transparent)]
    InvalidTransition(#[from] InstanceError),

    /// An executor currently holds the instance lease
    #[error("workflow instance {0} is being executed, try again later")]
    Busy(Uuid),

    #[error("invalid workflow definition: {0}")]
    Dsl(#[from] DslError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),
}

/// Admission request
#[derive(Debug, Clone)]
pub struct StartInstance {
    pub definition_id: Uuid,
    pub trigger_type: TriggerType,
    pub trigger_key: String,
    pub idempotency_key: String,
    pub context: ContextMap,
    /// Generated when absent
    pub correlation_id: Option<String>,
}

/// Where a replay resumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    FromStart,
    /// The most recently failed step; the first step when none failed
    FromFailedStep,
}

impl ReplayMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "from_start" => Some(Self::FromStart),
            "from_failed_step" => Some(Self::FromFailedStep),
            _ => None,
        }
    }
}

pub struct WorkflowService {
    store: Arc<dyn WorkflowStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    locks: Arc<dyn LockManager>,
    queue: Arc<DispatchQueue>,
    clock: Arc<dyn Clock>,
    idempotency_ttl: Duration,
    lease_ttl: Duration,
}

impl WorkflowService {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        locks: Arc<dyn LockManager>,
        queue: Arc<DispatchQueue>,
    ) -> Self {
        let defaults = EngineConfig::default();
        Self {
            store,
            idempotency,
            locks,
            queue,
            clock: Arc::new(SystemClock),
            idempotency_ttl: defaults.idempotency_ttl,
            lease_ttl: defaults.lease_ttl,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.idempotency_ttl = config.idempotency_ttl;
        self.lease_ttl = config.lease_ttl;
        self
    }

    // =========================================================================
    // Authoring
    // =========================================================================

    /// Validate `definition_text` and store it as version 1 of a new definition
    #[instrument(skip(self, description, definition_text))]
    pub async fn create_definition(
        &self,
        name: &str,
        description: Option<String>,
        trigger_key: &str,
        definition_text: &str,
    ) -> Result<WorkflowDefinition, ServiceError> {
        dsl::parse(definition_text)?;

        let now = self.clock.now();
        let definition = WorkflowDefinition::new(name, description, trigger_key, now);
        let version = WorkflowVersion::new(definition.id, 1, definition_text, now);
        self.store.create_definition(&definition, &version).await?;

        info!(definition_id = %definition.id, hash = %version.content_hash, "workflow definition created");
        Ok(definition)
    }

    /// Append a version and make it current; returns the new version number
    ///
    /// Running instances keep the version they were admitted with.
    #[instrument(skip(self, definition_text))]
    pub async fn add_version(
        &self,
        definition_id: Uuid,
        definition_text: &str,
    ) -> Result<i32, ServiceError> {
        dsl::parse(definition_text)?;

        let definition = self
            .store
            .get_definition(definition_id)
            .await?
            .ok_or(ServiceError::DefinitionNotFound(definition_id))?;

        let number = definition.current_version + 1;
        let version = WorkflowVersion::new(definition_id, number, definition_text, self.clock.now());
        self.store.append_version(&version).await?;

        info!(version = number, "workflow version added");
        Ok(number)
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Admit an instance, or return the one already admitted for its keys
    ///
    /// Safe to call repeatedly and concurrently with the same
    /// `(trigger_key, idempotency_key)`: every caller gets the same id. A
    /// still-active existing instance is re-enqueued.
    #[instrument(skip(self, request), fields(trigger_key = %request.trigger_key, idempotency_key = %request.idempotency_key))]
    pub async fn start_instance(&self, request: StartInstance) -> Result<Uuid, ServiceError> {
        let dedupe_key = format!("{}:{}", request.trigger_key, request.idempotency_key);
        let first_claim = self
            .idempotency
            .try_begin(&dedupe_key, self.idempotency_ttl)
            .await?;

        if let Some(id) = self.existing_admission(&request).await? {
            return Ok(id);
        }
        if !first_claim {
            debug!("idempotency key already claimed but no instance stored yet");
        }

        let definition = self
            .store
            .get_definition(request.definition_id)
            .await?
            .ok_or(ServiceError::DefinitionNotFound(request.definition_id))?;

        let instance = WorkflowInstance::new(
            NewInstance {
                definition_id: definition.id,
                version_number: definition.current_version,
                trigger_type: request.trigger_type,
                trigger_key: request.trigger_key.clone(),
                idempotency_key: request.idempotency_key.clone(),
                correlation_id: request
                    .correlation_id
                    .clone()
                    .unwrap_or_else(|| Uuid::now_v7().to_string()),
                context: request.context,
            },
            self.clock.now(),
        );

        match self.store.insert_instance(&instance).await {
            Ok(()) => {}
            Err(StoreError::DuplicateInstance { .. }) => {
                debug!("lost admission race, resolving to the winning instance");
                let winner = self
                    .store
                    .find_instance_by_idempotency(&request.trigger_key, &request.idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        StoreError::Database("duplicate instance vanished after insert".into())
                    })?;
                return Ok(winner.id);
            }
            Err(e) => return Err(e.into()),
        }

        self.queue.enqueue(instance.id);
        info!(
            instance_id = %instance.id,
            version = instance.version_number,
            trigger_type = %instance.trigger_type,
            "workflow instance admitted"
        );
        Ok(instance.id)
    }

    async fn existing_admission(&self, request: &StartInstance) -> Result<Option<Uuid>, ServiceError> {
        let Some(existing) = self
            .store
            .find_instance_by_idempotency(&request.trigger_key, &request.idempotency_key)
            .await?
        else {
            return Ok(None);
        };

        if existing.status.is_active() {
            self.queue.enqueue(existing.id);
        }
        debug!(instance_id = %existing.id, status = %existing.status, "duplicate admission");
        Ok(Some(existing.id))
    }

    /// Webhook admission: resolve the definition by its trigger key
    pub async fn start_by_trigger(
        &self,
        trigger_key: &str,
        idempotency_key: &str,
        context: ContextMap,
        correlation_id: Option<String>,
    ) -> Result<Uuid, ServiceError> {
        let definition = self
            .store
            .find_definition_by_trigger(trigger_key)
            .await?
            .ok_or_else(|| ServiceError::UnknownTrigger(trigger_key.to_string()))?;

        self.start_instance(StartInstance {
            definition_id: definition.id,
            trigger_type: TriggerType::Webhook,
            trigger_key: trigger_key.to_string(),
            idempotency_key: idempotency_key.to_string(),
            context,
            correlation_id,
        })
        .await
    }

    // =========================================================================
    // Replay
    // =========================================================================

    /// Reset a non-completed instance and queue it again
    ///
    /// Takes the instance lease, so a replay never races a running executor.
    #[instrument(skip(self))]
    pub async fn replay(&self, instance_id: Uuid, mode: ReplayMode) -> Result<(), ServiceError> {
        let key = instance_lock_key(instance_id);
        let lease = self
            .locks
            .try_acquire(&key, self.lease_ttl)
            .await?
            .ok_or(ServiceError::Busy(instance_id))?;

        let result = self.replay_leased(instance_id, mode).await;

        if let Err(e) = self.locks.release(&lease).await {
            warn!(error = %e, "failed to release lease after replay");
        }
        result?;

        self.queue.enqueue(instance_id);
        Ok(())
    }

    async fn replay_leased(&self, instance_id: Uuid, mode: ReplayMode) -> Result<(), ServiceError> {
        let mut instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or(ServiceError::InstanceNotFound(instance_id))?;

        let from_step = match mode {
            ReplayMode::FromStart => None,
            ReplayMode::FromFailedStep => self
                .store
                .latest_failed_step(instance_id)
                .await?
                .map(|step| step.step_id),
        };

        instance.prepare_replay(from_step, self.clock.now())?;
        self.store.commit(Checkpoint::new(&instance)).await?;

        info!(?mode, step_id = ?instance.current_step_id, "workflow instance replayed");
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Compiled graph of the definition's current version
    pub async fn compiled_dsl(&self, definition_id: Uuid) -> Result<WorkflowDsl, ServiceError> {
        let definition = self
            .store
            .get_definition(definition_id)
            .await?
            .ok_or(ServiceError::DefinitionNotFound(definition_id))?;
        let version = self
            .store
            .get_version(definition_id, definition.current_version)
            .await?
            .ok_or(StoreError::VersionNotFound {
                definition_id,
                version: definition.current_version,
            })?;
        Ok(version.compile()?)
    }

    pub async fn definitions(&self) -> Result<Vec<WorkflowDefinition>, ServiceError> {
        Ok(self.store.list_definitions().await?)
    }

    pub async fn instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, ServiceError> {
        self.store
            .get_instance(instance_id)
            .await?
            .ok_or(ServiceError::InstanceNotFound(instance_id))
    }

    pub async fn step_executions(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<StepExecution>, ServiceError> {
        Ok(self.store.list_step_executions(instance_id).await?)
    }

    pub async fn dead_letters(
        &self,
        instance_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<DeadLetterMessage>, ServiceError> {
        Ok(self.store.list_dead_letters(instance_id, limit).await?)
    }
}
