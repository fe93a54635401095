//! Workflow definitions and their immutable versions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::dsl::{self, DslError, WorkflowDsl};

/// Authoring-level workflow
///
/// Only `current_version` ever changes after creation; the definition text
/// itself lives in append-only [`WorkflowVersion`] rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Key external triggers (webhook routes, event names) resolve against
    pub trigger_key: String,
    pub current_version: i32,
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        trigger_key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            description,
            trigger_key: trigger_key.into(),
            current_version: 1,
            created_at: now,
        }
    }
}

/// Immutable snapshot of a definition's text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowVersion {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub version_number: i32,
    pub definition_json: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

impl WorkflowVersion {
    pub fn new(
        definition_id: Uuid,
        version_number: i32,
        definition_json: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let definition_json = definition_json.into();
        Self {
            id: Uuid::now_v7(),
            definition_id,
            version_number,
            content_hash: content_hash(&definition_json),
            definition_json,
            created_at: now,
        }
    }

    /// Compile the stored text into a step graph
    pub fn compile(&self) -> Result<WorkflowDsl, DslError> {
        dsl::parse(&self.definition_json)
    }
}

/// Upper-case hex SHA-256 of a definition text
pub fn content_hash(text: &str) -> String {
    hex::encode_upper(Sha256::digest(text.as_bytes()))
}
