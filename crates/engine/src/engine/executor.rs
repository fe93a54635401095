//! Workflow executor
//!
//! The `WorkflowExecutor` drives one instance from its current step until it
//! completes, parks (delay or retry), dead-letters, or the caller cancels:
//! - Takes the instance lease so only one worker runs it at a time
//! - Evaluates condition steps and dispatches every other kind to its handler
//! - Commits a checkpoint (instance, step attempt, dead letter, outbox) after
//!   each state change

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::events;
use crate::clock::{Clock, SystemClock};
use crate::condition::{ConditionEvaluator, JexlConditionEvaluator};
use crate::config::EngineConfig;
use crate::coordination::{instance_lock_key, CoordinationError, LockManager};
use crate::domain::{
    DeadLetterMessage, InstanceError, InstanceStatus, OutboxMessage, StepExecution,
    WorkflowInstance,
};
use crate::dsl::{DslError, StepDsl, StepSpec, WorkflowDsl};
use crate::handlers::{HandlerRegistry, StepContext, StepResult};
use crate::messaging::{EventBroadcaster, NullEventBroadcaster};
use crate::observability::EngineMetrics;
use crate::persistence::{Checkpoint, StoreError, WorkflowStore};
use crate::reliability::{run_with_timeout, TimeoutError};

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Lease backend error
    #[error("lock error: {0}")]
    Lock(#[from] CoordinationError),

    /// The pinned version row is gone
    #[error("workflow definition {definition_id} has no version {version}")]
    VersionMissing { definition_id: Uuid, version: i32 },

    /// A stored version no longer compiles
    #[error("stored workflow definition is invalid: {0}")]
    Dsl(#[from] DslError),

    /// The instance cursor points at a step the version does not define
    #[error("instance {instance_id} points at unknown step {step_id}")]
    UnknownStep { instance_id: Uuid, step_id: String },

    /// Invalid state transition
    #[error(transparent)]
    Instance(#[from] InstanceError),
}

/// How one dispatch of an instance ended
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Another worker holds the lease
    LockUnavailable,
    NotFound,
    /// Completed or dead-lettered before this dispatch
    AlreadyTerminal,
    /// Parked and its resume time is still in the future
    NotDue,
    Completed,
    /// Parked by a delay or a scheduled retry
    Waiting { resume_at: DateTime<Utc> },
    DeadLettered,
    /// The caller cancelled; the last checkpoint stands
    Cancelled,
    /// Another writer changed the instance concurrently
    Conflict,
}

/// Executes workflow instances step by step
///
/// # Example
///
/// ```ignore
/// use stepflow_engine::prelude::*;
///
/// let executor = WorkflowExecutor::new(store, locks, HandlerRegistry::standard(ai, publisher))
///     .with_clock(clock)
///     .with_broadcaster(broadcaster);
///
/// let outcome = executor.execute(instance_id, &CancellationToken::new()).await?;
/// ```
pub struct WorkflowExecutor {
    store: Arc<dyn WorkflowStore>,
    locks: Arc<dyn LockManager>,
    handlers: HandlerRegistry,
    conditions: Arc<dyn ConditionEvaluator>,
    broadcaster: Arc<dyn EventBroadcaster>,
    clock: Arc<dyn Clock>,
    metrics: Arc<EngineMetrics>,
    lease_ttl: Duration,
}

impl WorkflowExecutor {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        locks: Arc<dyn LockManager>,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            store,
            locks,
            handlers,
            conditions: Arc::new(JexlConditionEvaluator::new()),
            broadcaster: Arc::new(NullEventBroadcaster),
            clock: Arc::new(SystemClock),
            metrics: Arc::new(EngineMetrics::new()),
            lease_ttl: EngineConfig::default().lease_ttl,
        }
    }

    pub fn with_conditions(mut self, conditions: Arc<dyn ConditionEvaluator>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn EventBroadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Apply the executor-relevant parts of an engine configuration
    pub fn with_config(self, config: &EngineConfig) -> Self {
        self.with_lease_ttl(config.lease_ttl)
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Run an instance until it parks, finishes or `cancel` fires
    ///
    /// Returns without error when the lease is held elsewhere or the
    /// instance needs no work; the lease is released on every path.
    #[instrument(skip(self, cancel), fields(instance_id = %instance_id))]
    pub async fn execute(
        &self,
        instance_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let key = instance_lock_key(instance_id);
        let Some(lease) = self.locks.try_acquire(&key, self.lease_ttl).await? else {
            debug!("instance is leased by another worker");
            return Ok(ExecutionOutcome::LockUnavailable);
        };

        let result = self.run_leased(instance_id, cancel).await;

        match self.locks.release(&lease).await {
            Ok(true) => {}
            Ok(false) => warn!("lease expired before release"),
            Err(e) => warn!(error = %e, "failed to release lease"),
        }

        match result {
            Err(ExecutorError::Store(StoreError::ConcurrencyConflict {
                expected, actual, ..
            })) => {
                warn!(expected, actual, "instance changed concurrently, abandoning dispatch");
                Ok(ExecutionOutcome::Conflict)
            }
            other => other,
        }
    }

    async fn run_leased(
        &self,
        instance_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let Some(mut instance) = self.store.get_instance(instance_id).await? else {
            return Ok(ExecutionOutcome::NotFound);
        };
        if instance.status.is_terminal() {
            return Ok(ExecutionOutcome::AlreadyTerminal);
        }

        let version = self
            .store
            .get_version(instance.definition_id, instance.version_number)
            .await?
            .ok_or(ExecutorError::VersionMissing {
                definition_id: instance.definition_id,
                version: instance.version_number,
            })?;
        let dsl = version.compile()?;

        let now = self.clock.now();
        if instance.status == InstanceStatus::Waiting && !instance.is_due(now) {
            return Ok(ExecutionOutcome::NotDue);
        }

        instance.start(now)?;
        let started = events::instance_started(&instance, now);
        self.persist(&mut instance, None, None, vec![started]).await?;
        self.broadcaster
            .broadcast(events::INSTANCE_UPDATED, events::instance_view(&instance));
        info!(workflow = %dsl.name, version = instance.version_number, "instance running");

        let mut next = instance
            .current_step_id
            .clone()
            .or_else(|| dsl.first_step().map(|s| s.id.clone()));

        while let Some(step_id) = next.take() {
            if cancel.is_cancelled() {
                info!(step_id = %step_id, "dispatch cancelled between steps");
                return Ok(ExecutionOutcome::Cancelled);
            }

            let step = dsl.step(&step_id).ok_or_else(|| ExecutorError::UnknownStep {
                instance_id: instance.id,
                step_id: step_id.clone(),
            })?;

            match self.run_step(&mut instance, &dsl, step, cancel).await? {
                StepTransition::Continue(step_id) => next = Some(step_id),
                StepTransition::Stop(outcome) => return Ok(outcome),
            }
        }

        // Only reachable for a graph without steps
        let now = self.clock.now();
        instance.complete(now);
        let completed = events::workflow_completed(&instance, now);
        self.persist(&mut instance, None, None, vec![completed]).await?;
        self.metrics.record_completed();
        self.broadcaster
            .broadcast(events::INSTANCE_COMPLETED, events::instance_view(&instance));
        Ok(ExecutionOutcome::Completed)
    }

    #[instrument(skip_all, fields(step_id = %step.id, step_type = %step.kind()))]
    async fn run_step(
        &self,
        instance: &mut WorkflowInstance,
        dsl: &WorkflowDsl,
        step: &StepDsl,
        cancel: &CancellationToken,
    ) -> Result<StepTransition, ExecutorError> {
        if instance.current_step_id.as_deref() != Some(step.id.as_str()) {
            instance.advance_to(Some(step.id.clone()));
        }

        let prior = self.store.count_step_attempts(instance.id, &step.id).await?;
        let now = self.clock.now();
        let mut execution = StepExecution::new(
            instance.id,
            &step.id,
            step.kind(),
            prior,
            Some(Value::Object(instance.context.clone())),
            now,
        );
        execution.start_attempt(now);
        let started = events::step_started(&execution, now);
        self.persist(instance, Some(&execution), None, vec![started])
            .await?;
        self.broadcaster
            .broadcast(events::STEP_STARTED_BROADCAST, events::step_view(&execution));

        let call_started = Instant::now();
        let Some(result) = self.dispatch(instance, dsl, step, cancel).await else {
            // The attempt stays Running at the last checkpoint for the stale sweep
            info!(attempt = execution.attempt, "step interrupted by cancellation");
            return Ok(StepTransition::Stop(ExecutionOutcome::Cancelled));
        };
        debug!(elapsed = ?call_started.elapsed(), ?result, "step returned");

        let now = self.clock.now();
        let transition = match result {
            StepResult::Succeeded { output, next } => {
                if let Some(output) = &output {
                    instance
                        .context
                        .insert(format!("step_{}", step.id), output.clone());
                }
                execution.succeed(now, output);
                let next = next.or_else(|| step.next.clone());
                let mut outbox = vec![events::step_succeeded(&execution, now)];
                self.advance(instance, next, now, &mut outbox);

                self.persist(instance, Some(&execution), None, outbox)
                    .await?;
                self.broadcaster
                    .broadcast(events::STEP_SUCCEEDED_BROADCAST, events::step_view(&execution));
                self.after_advance(instance)
            }
            StepResult::Skipped { next } => {
                execution.skip(now, next.as_deref());
                let mut outbox = Vec::new();
                self.advance(instance, next, now, &mut outbox);

                self.persist(instance, Some(&execution), None, outbox)
                    .await?;
                self.broadcaster
                    .broadcast(events::STEP_SUCCEEDED_BROADCAST, events::step_view(&execution));
                self.after_advance(instance)
            }
            StepResult::Waiting { resume_at } => {
                execution.wait_until(resume_at);
                instance.mark_waiting(resume_at);
                let waiting = events::step_waiting(&execution, resume_at, now);

                self.persist(instance, Some(&execution), None, vec![waiting])
                    .await?;
                self.broadcaster
                    .broadcast(events::STEP_WAITING_BROADCAST, events::step_view(&execution));
                info!(%resume_at, "instance waiting");
                StepTransition::Stop(ExecutionOutcome::Waiting { resume_at })
            }
            StepResult::Failed { error, retryable } => {
                execution.fail(now, error.as_str());
                let policy = step.policy();

                if retryable && policy.has_attempts_remaining(execution.attempt) {
                    let next_retry = policy.next_retry_at(execution.attempt, now);
                    execution.wait_until(next_retry);
                    instance.mark_waiting(next_retry);
                    instance.last_error = Some(error.clone());
                    let scheduled = events::step_retry_scheduled(&execution, next_retry, now);

                    self.persist(instance, Some(&execution), None, vec![scheduled])
                        .await?;
                    self.metrics.record_retry();
                    self.broadcaster
                        .broadcast(events::STEP_WAITING_BROADCAST, events::step_view(&execution));
                    warn!(
                        attempt = execution.attempt,
                        max_attempts = policy.max_attempts,
                        %next_retry,
                        error = %error,
                        "step failed, retry scheduled"
                    );
                    StepTransition::Stop(ExecutionOutcome::Waiting {
                        resume_at: next_retry,
                    })
                } else {
                    instance.fail(error.as_str());
                    instance.move_to_dead_letter(error.as_str());
                    let letter = DeadLetterMessage::new(
                        instance.id,
                        error.as_str(),
                        Value::Object(instance.context.clone()),
                        now,
                    );
                    let dead = events::workflow_dead_lettered(instance, &error, now);

                    self.persist(instance, Some(&execution), Some(&letter), vec![dead])
                        .await?;
                    self.metrics.record_dead_letter();
                    self.broadcaster
                        .broadcast(events::INSTANCE_FAILED, events::instance_view(instance));
                    error!(attempt = execution.attempt, error = %error, "instance dead-lettered");
                    StepTransition::Stop(ExecutionOutcome::DeadLettered)
                }
            }
        };

        if let Some(duration_ms) = execution.duration_ms {
            self.metrics.record_step(&step.id, duration_ms);
        }
        Ok(transition)
    }

    /// Produce the step result; errors become `Failed`
    ///
    /// `None` means the caller cancelled while the step was in flight.
    async fn dispatch(
        &self,
        instance: &WorkflowInstance,
        dsl: &WorkflowDsl,
        step: &StepDsl,
        cancel: &CancellationToken,
    ) -> Option<StepResult> {
        if let StepSpec::Condition(condition) = &step.spec {
            return Some(
                match self
                    .conditions
                    .evaluate(&condition.expression, &instance.context)
                {
                    Ok(true) => StepResult::skipped(condition.true_next.as_str()),
                    Ok(false) => StepResult::skipped(condition.false_next.as_str()),
                    Err(e) => {
                        warn!(error = %e, expression = %condition.expression, "condition failed");
                        StepResult::failed(e.to_string(), true)
                    }
                },
            );
        }

        let Some(handler) = self.handlers.get(step.kind()) else {
            error!("no handler registered for step kind");
            return Some(StepResult::failed(
                format!("no handler registered for {} steps", step.kind()),
                false,
            ));
        };

        let ctx = StepContext {
            instance,
            workflow: dsl,
            step,
            data: &instance.context,
            clock: self.clock.as_ref(),
        };

        match run_with_timeout(step.timeout(), cancel, |child| handler.handle(ctx, child)).await {
            Ok(Ok(result)) => Some(result),
            Err(TimeoutError::Cancelled) => None,
            Ok(Err(_)) if cancel.is_cancelled() => None,
            Ok(Err(e)) => {
                error!(error = %e, "step handler failed");
                Some(StepResult::failed(e.to_string(), true))
            }
            Err(e @ TimeoutError::Elapsed(_)) => {
                warn!(error = %e, "step call timed out");
                Some(StepResult::failed(e.to_string(), true))
            }
        }
    }

    /// Move the cursor; completes the instance when there is no next step
    fn advance(
        &self,
        instance: &mut WorkflowInstance,
        next: Option<String>,
        now: DateTime<Utc>,
        outbox: &mut Vec<OutboxMessage>,
    ) {
        let finished = next.is_none();
        instance.advance_to(next);
        if finished {
            instance.complete(now);
            outbox.push(events::workflow_completed(instance, now));
        }
    }

    fn after_advance(&self, instance: &WorkflowInstance) -> StepTransition {
        match &instance.current_step_id {
            Some(next) if instance.status != InstanceStatus::Completed => {
                StepTransition::Continue(next.clone())
            }
            _ => {
                self.metrics.record_completed();
                self.broadcaster
                    .broadcast(events::INSTANCE_COMPLETED, events::instance_view(instance));
                info!("instance completed");
                StepTransition::Stop(ExecutionOutcome::Completed)
            }
        }
    }

    async fn persist(
        &self,
        instance: &mut WorkflowInstance,
        step: Option<&StepExecution>,
        dead_letter: Option<&DeadLetterMessage>,
        outbox: Vec<OutboxMessage>,
    ) -> Result<(), ExecutorError> {
        let mut checkpoint = Checkpoint::new(instance).with_events(outbox);
        checkpoint.step_execution = step;
        checkpoint.dead_letter = dead_letter;
        let row_version = self.store.commit(checkpoint).await?;
        instance.row_version = row_version;
        Ok(())
    }
}

enum StepTransition {
    Continue(String),
    Stop(ExecutionOutcome),
}
