//! Step handlers
//!
//! This module provides:
//! - [`StepHandler`] trait implemented once per step kind
//! - [`StepContext`] / [`StepResult`] passed in and out of a handler call
//! - [`HandlerRegistry`] mapping step kinds to handlers
//! - Template rendering shared by every handler

mod ai;
mod delay;
mod http;
mod queue_publish;
pub mod template;

pub use ai::{AiClient, AiHandler, EchoAiClient, ECHO_MAX_CHARS};
pub use delay::{DelayHandler, DEFAULT_DELAY_SECONDS};
pub use http::{HttpHandler, DEFAULT_HTTP_RETRY_DELAY_MS};
pub use queue_publish::QueuePublishHandler;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::domain::{ContextMap, WorkflowInstance};
use crate::dsl::{StepDsl, StepKind, WorkflowDsl};
use crate::messaging::QueuePublisher;

/// Everything a handler may read while executing one step
#[derive(Clone, Copy)]
pub struct StepContext<'a> {
    pub instance: &'a WorkflowInstance,
    pub workflow: &'a WorkflowDsl,
    pub step: &'a StepDsl,
    /// Context map of the instance, including earlier step outputs
    pub data: &'a ContextMap,
    pub clock: &'a dyn Clock,
}

/// Outcome of one step attempt
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    /// Step finished; `next` overrides the step's static successor
    Succeeded {
        output: Option<Value>,
        next: Option<String>,
    },
    /// Park the instance until `resume_at`
    Waiting { resume_at: DateTime<Utc> },
    Failed { error: String, retryable: bool },
    /// Step produced no output and control moves to `next`
    Skipped { next: Option<String> },
}

impl StepResult {
    pub fn succeeded(output: Option<Value>) -> Self {
        Self::Succeeded { output, next: None }
    }

    pub fn waiting(resume_at: DateTime<Utc>) -> Self {
        Self::Waiting { resume_at }
    }

    pub fn failed(error: impl Into<String>, retryable: bool) -> Self {
        Self::Failed {
            error: error.into(),
            retryable,
        }
    }

    pub fn skipped(next: impl Into<String>) -> Self {
        Self::Skipped {
            next: Some(next.into()),
        }
    }
}

/// Errors a handler raises instead of returning a `StepResult`
///
/// The executor turns every one of these into a retryable failure.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("step {step_id} is not a {expected} step")]
    KindMismatch { step_id: String, expected: StepKind },

    #[error("ai completion failed: {0}")]
    Ai(String),

    #[error("queue publish failed: {0}")]
    Publish(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("cancelled")]
    Cancelled,
}

impl HandlerError {
    pub(crate) fn kind_mismatch(step: &StepDsl, expected: StepKind) -> Self {
        Self::KindMismatch {
            step_id: step.id.clone(),
            expected,
        }
    }
}

/// Executes steps of one kind
#[async_trait]
pub trait StepHandler: Send + Sync + 'static {
    fn kind(&self) -> StepKind;

    /// Run one attempt; `cancel` fires on timeout or shutdown
    async fn handle(
        &self,
        ctx: StepContext<'_>,
        cancel: CancellationToken,
    ) -> Result<StepResult, HandlerError>;
}

/// Handlers keyed by step kind
///
/// Condition steps are evaluated by the executor and need no handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<StepKind, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in AI, HTTP, delay and queue-publish handlers
    pub fn standard(ai: Arc<dyn AiClient>, publisher: Arc<dyn QueuePublisher>) -> Self {
        let mut registry = Self::new();
        registry.register(AiHandler::new(ai));
        registry.register(HttpHandler::new());
        registry.register(DelayHandler);
        registry.register(QueuePublishHandler::new(publisher));
        registry
    }

    /// Register a handler, replacing any previous one for its kind
    pub fn register(&mut self, handler: impl StepHandler) -> &mut Self {
        self.handlers.insert(handler.kind(), Arc::new(handler));
        self
    }

    pub fn with_handler(mut self, handler: impl StepHandler) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<StepKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
