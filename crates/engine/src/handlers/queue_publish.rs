//! Message broker publication steps

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{template, HandlerError, StepContext, StepHandler, StepResult};
use crate::dsl::{StepKind, StepSpec};
use crate::messaging::QueuePublisher;

/// Renders the payload template and hands it to the broker
pub struct QueuePublishHandler {
    publisher: Arc<dyn QueuePublisher>,
}

impl QueuePublishHandler {
    pub fn new(publisher: Arc<dyn QueuePublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl StepHandler for QueuePublishHandler {
    fn kind(&self) -> StepKind {
        StepKind::QueuePublish
    }

    async fn handle(
        &self,
        ctx: StepContext<'_>,
        cancel: CancellationToken,
    ) -> Result<StepResult, HandlerError> {
        let StepSpec::QueuePublish(spec) = &ctx.step.spec else {
            return Err(HandlerError::kind_mismatch(ctx.step, StepKind::QueuePublish));
        };

        let payload = template::render(&spec.payload_template, ctx.data);
        tokio::select! {
            out = self.publisher.publish(&spec.topic, &spec.routing_key, &payload) => {
                out.map_err(|e| HandlerError::Publish(e.to_string()))?
            }
            _ = cancel.cancelled() => return Err(HandlerError::Cancelled),
        }

        Ok(StepResult::succeeded(Some(json!({ "queued": true }))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::Fixture;
    use crate::messaging::InMemoryQueuePublisher;

    fn fixture() -> Fixture {
        Fixture::new(
            json!({
                "name": "t",
                "trigger": {"type": "manual"},
                "steps": [{
                    "id": "q1", "type": "queue_publish", "topic": "workflow.events",
                    "routingKey": "triage.done",
                    "payloadTemplate": "{\"done\":true,\"customer\":\"{{ customer }}\"}"
                }]
            }),
            json!({"customer": "acme"}),
        )
    }

    #[tokio::test]
    async fn test_publishes_rendered_payload() {
        let publisher = Arc::new(InMemoryQueuePublisher::new());
        let fx = fixture();

        let result = QueuePublishHandler::new(publisher.clone())
            .handle(fx.ctx("q1"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result, StepResult::succeeded(Some(json!({"queued": true}))));
        let sent = publisher.published();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "workflow.events");
        assert_eq!(sent[0].routing_key, "triage.done");
        assert_eq!(sent[0].payload, r#"{"done":true,"customer":"acme"}"#);
    }

    #[tokio::test]
    async fn test_broker_failure_is_a_handler_error() {
        let publisher = Arc::new(InMemoryQueuePublisher::new());
        publisher.set_failing(true);
        let fx = fixture();

        let err = QueuePublishHandler::new(publisher.clone())
            .handle(fx.ctx("q1"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Publish(_)));
        assert!(publisher.published().is_empty());
    }
}
