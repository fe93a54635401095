//! AI completion steps

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{template, HandlerError, StepContext, StepHandler, StepResult};
use crate::dsl::{StepKind, StepSpec};

/// Longest completion [`EchoAiClient`] returns, in characters
pub const ECHO_MAX_CHARS: usize = 120;

/// Text completion provider
#[async_trait]
pub trait AiClient: Send + Sync + 'static {
    async fn complete(&self, provider: &str, model: &str, prompt: &str)
        -> Result<String, HandlerError>;
}

/// Offline client that echoes the prompt back
///
/// Used when no model provider is configured, and in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoAiClient;

#[async_trait]
impl AiClient for EchoAiClient {
    async fn complete(
        &self,
        provider: &str,
        model: &str,
        prompt: &str,
    ) -> Result<String, HandlerError> {
        let text = format!("[{provider}/{model}] {prompt}");
        Ok(text.chars().take(ECHO_MAX_CHARS).collect())
    }
}

/// Renders the prompt template and stores the completion text as output
pub struct AiHandler {
    client: Arc<dyn AiClient>,
}

impl AiHandler {
    pub fn new(client: Arc<dyn AiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StepHandler for AiHandler {
    fn kind(&self) -> StepKind {
        StepKind::Ai
    }

    async fn handle(
        &self,
        ctx: StepContext<'_>,
        cancel: CancellationToken,
    ) -> Result<StepResult, HandlerError> {
        let StepSpec::Ai(spec) = &ctx.step.spec else {
            return Err(HandlerError::kind_mismatch(ctx.step, StepKind::Ai));
        };

        let prompt = template::render(&spec.prompt_template, ctx.data);
        debug!(step_id = %ctx.step.id, provider = %spec.provider, model = %spec.model, "requesting completion");

        let text = tokio::select! {
            out = self.client.complete(&spec.provider, &spec.model, &prompt) => out?,
            _ = cancel.cancelled() => return Err(HandlerError::Cancelled),
        };

        Ok(StepResult::succeeded(Some(Value::String(text))))
    }
}
