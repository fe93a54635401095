//! Workflow instances

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Per-instance data map; the only dynamically typed state in the engine
pub type ContextMap = serde_json::Map<String, Value>;

/// How an instance was admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Webhook,
    Manual,
    Event,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Manual => "manual",
            Self::Event => "event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "webhook" => Some(Self::Webhook),
            "manual" => Some(Self::Manual),
            "event" => Some(Self::Event),
            _ => None,
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Admitted or replayed, not picked up yet
    Pending,

    /// An executor is (or was, before a crash) driving steps
    Running,

    /// Parked until `next_run_at`
    Waiting,

    /// Terminal success
    Completed,

    /// Retries exhausted; immediately followed by DeadLettered
    Failed,

    /// Terminal failure, recoverable only by replay
    DeadLettered,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "waiting" => Some(Self::Waiting),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "dead_lettered" => Some(Self::DeadLettered),
            _ => None,
        }
    }

    /// Executors never touch instances in these states
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::DeadLettered)
    }

    /// States in which an instance still has work to do
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Waiting)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected instance transitions
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum InstanceError {
    #[error("workflow instance {0} is completed and cannot be restarted")]
    AlreadyCompleted(Uuid),
}

/// One execution of a pinned workflow version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition_id: Uuid,
    /// Version captured at admission; never follows later versions
    pub version_number: i32,
    pub trigger_type: TriggerType,
    pub trigger_key: String,
    pub idempotency_key: String,
    pub correlation_id: String,
    pub status: InstanceStatus,
    pub current_step_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub context: ContextMap,
    pub next_run_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped on every committed write
    pub row_version: i64,
}

/// Fields supplied at admission
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub definition_id: Uuid,
    pub version_number: i32,
    pub trigger_type: TriggerType,
    pub trigger_key: String,
    pub idempotency_key: String,
    pub correlation_id: String,
    pub context: ContextMap,
}

impl WorkflowInstance {
    /// Fresh Pending instance, due immediately
    pub fn new(fields: NewInstance, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            definition_id: fields.definition_id,
            version_number: fields.version_number,
            trigger_type: fields.trigger_type,
            trigger_key: fields.trigger_key,
            idempotency_key: fields.idempotency_key,
            correlation_id: fields.correlation_id,
            status: InstanceStatus::Pending,
            current_step_id: None,
            started_at: None,
            completed_at: None,
            last_error: None,
            context: fields.context,
            next_run_at: Some(now),
            row_version: 0,
        }
    }

    /// Enter Running
    ///
    /// The first call fixes `started_at`; resumptions keep it.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), InstanceError> {
        if self.status == InstanceStatus::Completed {
            return Err(InstanceError::AlreadyCompleted(self.id));
        }

        self.status = InstanceStatus::Running;
        self.started_at.get_or_insert(now);
        self.last_error = None;
        Ok(())
    }

    pub fn mark_waiting(&mut self, next_run_at: DateTime<Utc>) {
        self.status = InstanceStatus::Waiting;
        self.next_run_at = Some(next_run_at);
    }

    /// Move the cursor to another step (or past the last one)
    pub fn advance_to(&mut self, step_id: Option<String>) {
        self.current_step_id = step_id;
        self.next_run_at = None;
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = InstanceStatus::Completed;
        self.completed_at = Some(now);
        self.next_run_at = None;
        self.last_error = None;
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = InstanceStatus::Failed;
        self.last_error = Some(reason.into());
    }

    pub fn move_to_dead_letter(&mut self, reason: impl Into<String>) {
        self.status = InstanceStatus::DeadLettered;
        self.last_error = Some(reason.into());
        self.next_run_at = None;
    }

    /// Reset for a replay starting at `step_id` (`None` = first step)
    pub fn prepare_replay(
        &mut self,
        step_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), InstanceError> {
        if self.status == InstanceStatus::Completed {
            return Err(InstanceError::AlreadyCompleted(self.id));
        }

        self.current_step_id = step_id;
        self.last_error = None;
        self.completed_at = None;
        self.status = InstanceStatus::Pending;
        self.next_run_at = Some(now);
        Ok(())
    }

    /// Whether a parked instance may run at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at.map_or(true, |at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new(
            NewInstance {
                definition_id: Uuid::now_v7(),
                version_number: 1,
                trigger_type: TriggerType::Webhook,
                trigger_key: "orders".into(),
                idempotency_key: "evt-1".into(),
                correlation_id: "corr".into(),
                context: ContextMap::new(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_start_fixes_started_at_once() {
        let mut inst = instance();
        let first = Utc::now();
        inst.start(first).unwrap();
        assert_eq!(inst.status, InstanceStatus::Running);
        assert_eq!(inst.started_at, Some(first));

        inst.mark_waiting(first + Duration::seconds(5));
        inst.start(first + Duration::seconds(10)).unwrap();
        assert_eq!(inst.started_at, Some(first));
    }

    #[test]
    fn test_start_clears_last_error() {
        let mut inst = instance();
        inst.fail("boom");
        inst.start(Utc::now()).unwrap();
        assert_eq!(inst.last_error, None);
    }

    #[test]
    fn test_completed_is_terminal() {
        let mut inst = instance();
        inst.start(Utc::now()).unwrap();
        inst.complete(Utc::now());

        assert_eq!(
            inst.start(Utc::now()),
            Err(InstanceError::AlreadyCompleted(inst.id))
        );
        assert!(inst.prepare_replay(None, Utc::now()).is_err());
        assert_eq!(inst.status, InstanceStatus::Completed);
        assert!(inst.status.is_terminal());
    }

    #[test]
    fn test_prepare_replay_resets_cursor() {
        let mut inst = instance();
        inst.start(Utc::now()).unwrap();
        inst.current_step_id = Some("call".into());
        inst.fail("HTTP 500");
        inst.move_to_dead_letter("HTTP 500");

        let now = Utc::now();
        inst.prepare_replay(None, now).unwrap();
        assert_eq!(inst.status, InstanceStatus::Pending);
        assert_eq!(inst.current_step_id, None);
        assert_eq!(inst.last_error, None);
        assert_eq!(inst.next_run_at, Some(now));
    }

    #[test]
    fn test_is_due() {
        let mut inst = instance();
        let now = Utc::now();
        inst.mark_waiting(now + Duration::seconds(10));
        assert!(!inst.is_due(now));
        assert!(inst.is_due(now + Duration::seconds(10)));

        inst.advance_to(Some("next".into()));
        assert!(inst.is_due(now));
    }
}
