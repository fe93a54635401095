//! Typed workflow definition
//!
//! The JSON document stored with each workflow version deserializes into
//! [`WorkflowDsl`]. Step kinds form a closed set, selected by the `type`
//! discriminator on each step.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::reliability::RetryPolicy;

/// Name used when a definition omits one
pub const UNNAMED_WORKFLOW: &str = "unnamed";

/// Timeout applied to AI and HTTP steps that do not set `timeoutSeconds`
pub const DEFAULT_STEP_TIMEOUT_SECONDS: u64 = 30;

/// Compiled workflow definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDsl {
    #[serde(default = "unnamed", deserialize_with = "name_or_unnamed")]
    pub name: String,

    pub trigger: TriggerDsl,

    #[serde(default)]
    pub steps: Vec<StepDsl>,
}

fn unnamed() -> String {
    UNNAMED_WORKFLOW.to_string()
}

fn name_or_unnamed<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_else(unnamed))
}

impl WorkflowDsl {
    /// Entry step; `None` only for a graph that never passed validation
    pub fn first_step(&self) -> Option<&StepDsl> {
        self.steps.first()
    }

    /// Look up a step by id
    pub fn step(&self, id: &str) -> Option<&StepDsl> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// How instances of a workflow are started
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDsl {
    #[serde(rename = "type")]
    pub trigger_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Kind tag of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Ai,
    Http,
    Condition,
    Delay,
    QueuePublish,
}

impl StepKind {
    pub const ALL: [StepKind; 5] = [
        StepKind::Ai,
        StepKind::Http,
        StepKind::Condition,
        StepKind::Delay,
        StepKind::QueuePublish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Http => "http",
            Self::Condition => "condition",
            Self::Delay => "delay",
            Self::QueuePublish => "queue_publish",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of the step graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepDsl {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    #[serde(flatten)]
    pub spec: StepSpec,
}

impl StepDsl {
    pub fn kind(&self) -> StepKind {
        self.spec.kind()
    }

    /// Retry policy in force for this step
    pub fn policy(&self) -> RetryPolicy {
        self.retry_policy.clone().unwrap_or_default()
    }

    /// Per-call time limit; only AI and HTTP steps are bounded
    pub fn timeout(&self) -> Option<Duration> {
        match &self.spec {
            StepSpec::Ai(s) => Some(Duration::from_secs(s.timeout_seconds)),
            StepSpec::Http(s) => Some(Duration::from_secs(s.timeout_seconds)),
            _ => None,
        }
    }

    /// Every step id this step can transfer control to
    pub fn successors(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.next.as_deref().into_iter().collect();
        if let StepSpec::Condition(c) = &self.spec {
            out.push(&c.true_next);
            out.push(&c.false_next);
        }
        out
    }
}

/// Kind-specific payload of a step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepSpec {
    Ai(AiStep),
    Http(HttpStep),
    Condition(ConditionStep),
    Delay(DelayStep),
    QueuePublish(QueuePublishStep),
}

impl StepSpec {
    pub fn kind(&self) -> StepKind {
        match self {
            Self::Ai(_) => StepKind::Ai,
            Self::Http(_) => StepKind::Http,
            Self::Condition(_) => StepKind::Condition,
            Self::Delay(_) => StepKind::Delay,
            Self::QueuePublish(_) => StepKind::QueuePublish,
        }
    }
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECONDS
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AiStep {
    pub provider: String,
    pub model: String,
    pub prompt_template: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HttpStep {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_template: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConditionStep {
    pub expression: String,
    pub true_next: String,
    pub false_next: String,
}

/// Longest relative delay a definition may declare (100 years)
pub const MAX_DELAY_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DelayStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until_utc: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueuePublishStep {
    pub topic: String,
    pub routing_key: String,
    pub payload_template: String,
}
