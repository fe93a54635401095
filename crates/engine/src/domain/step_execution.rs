//! Step attempt records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::dsl::StepKind;

/// Status of one step attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Waiting,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Waiting => "waiting",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "waiting" => Some(Self::Waiting),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt of one step of one instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepExecution {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub step_id: String,
    pub step_kind: StepKind,
    pub status: StepStatus,
    /// 1-based, strictly increasing per (instance, step id)
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    /// New Pending attempt following `prior_attempts` earlier ones
    pub fn new(
        instance_id: Uuid,
        step_id: impl Into<String>,
        step_kind: StepKind,
        prior_attempts: u32,
        input: Option<Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            step_id: step_id.into(),
            step_kind,
            status: StepStatus::Pending,
            attempt: prior_attempts + 1,
            started_at: now,
            ended_at: None,
            duration_ms: None,
            input,
            output: None,
            error: None,
            next_run_at: None,
        }
    }

    pub fn start_attempt(&mut self, now: DateTime<Utc>) {
        self.status = StepStatus::Running;
        self.started_at = now;
    }

    pub fn succeed(&mut self, now: DateTime<Utc>, output: Option<Value>) {
        self.finish(now);
        self.status = StepStatus::Succeeded;
        self.output = output;
        self.error = None;
    }

    /// Condition steps record the branch taken instead of an output
    pub fn skip(&mut self, now: DateTime<Utc>, next: Option<&str>) {
        self.finish(now);
        self.status = StepStatus::Skipped;
        self.output = Some(serde_json::json!({ "skipped": true, "next": next }));
        self.error = None;
    }

    pub fn fail(&mut self, now: DateTime<Utc>, error: impl Into<String>) {
        self.finish(now);
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
    }

    pub fn wait_until(&mut self, next_run_at: DateTime<Utc>) {
        self.status = StepStatus::Waiting;
        self.next_run_at = Some(next_run_at);
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.ended_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_attempt_follows_prior_count() {
        let now = Utc::now();
        let first = StepExecution::new(Uuid::now_v7(), "call", StepKind::Http, 0, None, now);
        let third = StepExecution::new(Uuid::now_v7(), "call", StepKind::Http, 2, None, now);
        assert_eq!(first.attempt, 1);
        assert_eq!(third.attempt, 3);
        assert_eq!(first.status, StepStatus::Pending);
    }

    #[test]
    fn test_succeed_records_duration() {
        let start = Utc::now();
        let mut exec = StepExecution::new(Uuid::now_v7(), "ask", StepKind::Ai, 0, None, start);
        exec.start_attempt(start);
        exec.succeed(start + Duration::milliseconds(250), Some(Value::from("ok")));

        assert_eq!(exec.status, StepStatus::Succeeded);
        assert_eq!(exec.duration_ms, Some(250));
        assert_eq!(exec.output, Some(Value::from("ok")));
    }

    #[test]
    fn test_failed_then_waiting_keeps_error() {
        let now = Utc::now();
        let mut exec = StepExecution::new(Uuid::now_v7(), "call", StepKind::Http, 0, None, now);
        exec.start_attempt(now);
        exec.fail(now, "HTTP 503");
        exec.wait_until(now + Duration::seconds(1));

        assert_eq!(exec.status, StepStatus::Waiting);
        assert_eq!(exec.error.as_deref(), Some("HTTP 503"));
        assert_eq!(exec.next_run_at, Some(now + Duration::seconds(1)));
    }

    #[test]
    fn test_skip_records_branch() {
        let now = Utc::now();
        let mut exec = StepExecution::new(Uuid::now_v7(), "route", StepKind::Condition, 0, None, now);
        exec.start_attempt(now);
        exec.skip(now, Some("call"));
        assert_eq!(exec.status, StepStatus::Skipped);
        assert_eq!(exec.output.unwrap()["next"], "call");
    }
}
