//! Outbox event and broadcast payloads emitted by the executor

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::domain::{OutboxMessage, StepExecution, WorkflowInstance};

// =============================================================================
// Outbox event types (also the broker routing keys)
// =============================================================================

pub const WORKFLOW_INSTANCE_STARTED: &str = "WorkflowInstanceStarted";
pub const STEP_STARTED: &str = "StepStarted";
pub const STEP_SUCCEEDED: &str = "StepSucceeded";
pub const STEP_WAITING: &str = "StepWaiting";
pub const STEP_RETRY_SCHEDULED: &str = "StepRetryScheduled";
pub const WORKFLOW_COMPLETED: &str = "WorkflowCompleted";
pub const WORKFLOW_DEAD_LETTERED: &str = "WorkflowDeadLettered";

// =============================================================================
// Broadcast names
// =============================================================================

pub const INSTANCE_UPDATED: &str = "instanceUpdated";
pub const INSTANCE_COMPLETED: &str = "instanceCompleted";
pub const INSTANCE_FAILED: &str = "instanceFailed";
pub const STEP_STARTED_BROADCAST: &str = "stepStarted";
pub const STEP_SUCCEEDED_BROADCAST: &str = "stepSucceeded";
pub const STEP_WAITING_BROADCAST: &str = "stepWaiting";

pub fn instance_started(instance: &WorkflowInstance, now: DateTime<Utc>) -> OutboxMessage {
    OutboxMessage::new(
        WORKFLOW_INSTANCE_STARTED,
        json!({
            "instanceId": instance.id,
            "correlationId": instance.correlation_id,
            "at": now,
        }),
        now,
    )
}

pub fn step_started(step: &StepExecution, now: DateTime<Utc>) -> OutboxMessage {
    OutboxMessage::new(
        STEP_STARTED,
        json!({
            "instanceId": step.instance_id,
            "stepId": step.step_id,
            "attempt": step.attempt,
            "at": now,
        }),
        now,
    )
}

pub fn step_succeeded(step: &StepExecution, now: DateTime<Utc>) -> OutboxMessage {
    OutboxMessage::new(
        STEP_SUCCEEDED,
        json!({
            "instanceId": step.instance_id,
            "stepId": step.step_id,
            "at": now,
        }),
        now,
    )
}

pub fn step_waiting(
    step: &StepExecution,
    resume_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> OutboxMessage {
    OutboxMessage::new(
        STEP_WAITING,
        json!({
            "instanceId": step.instance_id,
            "stepId": step.step_id,
            "at": resume_at,
        }),
        now,
    )
}

pub fn step_retry_scheduled(
    step: &StepExecution,
    next_retry: DateTime<Utc>,
    now: DateTime<Utc>,
) -> OutboxMessage {
    OutboxMessage::new(
        STEP_RETRY_SCHEDULED,
        json!({
            "instanceId": step.instance_id,
            "stepId": step.step_id,
            "attempts": step.attempt,
            "nextRetry": next_retry,
        }),
        now,
    )
}

pub fn workflow_completed(instance: &WorkflowInstance, now: DateTime<Utc>) -> OutboxMessage {
    OutboxMessage::new(
        WORKFLOW_COMPLETED,
        json!({ "instanceId": instance.id, "at": now }),
        now,
    )
}

pub fn workflow_dead_lettered(
    instance: &WorkflowInstance,
    reason: &str,
    now: DateTime<Utc>,
) -> OutboxMessage {
    OutboxMessage::new(
        WORKFLOW_DEAD_LETTERED,
        json!({ "instanceId": instance.id, "reason": reason, "at": now }),
        now,
    )
}

/// Broadcast payload describing an instance
pub fn instance_view(instance: &WorkflowInstance) -> Value {
    json!({
        "instanceId": instance.id,
        "status": instance.status.as_str(),
        "currentStepId": instance.current_step_id,
        "lastError": instance.last_error,
        "nextRunAt": instance.next_run_at,
    })
}

/// Broadcast payload describing a step attempt
pub fn step_view(step: &StepExecution) -> Value {
    json!({
        "instanceId": step.instance_id,
        "stepId": step.step_id,
        "stepType": step.step_kind.as_str(),
        "status": step.status.as_str(),
        "attempt": step.attempt,
        "error": step.error,
        "nextRunAt": step.next_run_at,
        "durationMs": step.duration_ms,
    })
}
