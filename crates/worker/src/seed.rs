//! Sample workflows installed on an empty store

use anyhow::{Context, Result};
use serde_json::json;
use stepflow_engine::engine::WorkflowService;
use tracing::info;

struct Sample {
    name: &'static str,
    description: &'static str,
    trigger_key: &'static str,
    definition: serde_json::Value,
}

fn samples() -> Vec<Sample> {
    vec![
        Sample {
            name: "ai-triage-flow",
            description: "Webhook -> AI -> Condition -> HTTP -> Queue",
            trigger_key: "ai-triage",
            definition: json!({
                "name": "ai-triage-flow",
                "trigger": {"type": "webhook", "route": "ai-triage", "secret": "secret-123"},
                "steps": [
                    {"id": "ai1", "type": "ai", "provider": "mock", "model": "gpt-4o-mini",
                     "promptTemplate": "Classify request", "timeoutSeconds": 30,
                     "retryPolicy": {"maxAttempts": 3, "initialDelayMs": 500}, "next": "cond1"},
                    {"id": "cond1", "type": "condition", "expression": "1==1",
                     "trueNext": "http1", "falseNext": "q1"},
                    {"id": "http1", "type": "http", "method": "POST",
                     "url": "https://postman-echo.com/post", "timeoutSeconds": 20,
                     "retryPolicy": {"maxAttempts": 3, "initialDelayMs": 1000}, "next": "q1"},
                    {"id": "q1", "type": "queue_publish", "topic": "workflow.events",
                     "routingKey": "triage.done", "payloadTemplate": "{\"done\":true}"}
                ]
            }),
        },
        Sample {
            name: "delayed-followup",
            description: "Webhook -> Delay -> HTTP",
            trigger_key: "delayed-followup",
            definition: json!({
                "name": "delayed-followup",
                "trigger": {"type": "webhook", "route": "delayed-followup"},
                "steps": [
                    {"id": "d1", "type": "delay", "delaySeconds": 10, "next": "h1"},
                    {"id": "h1", "type": "http", "method": "POST",
                     "url": "https://postman-echo.com/post", "timeoutSeconds": 20,
                     "retryPolicy": {"maxAttempts": 2, "initialDelayMs": 1000}}
                ]
            }),
        },
    ]
}

/// Install the sample workflows unless definitions already exist
///
/// Returns how many definitions were created.
pub async fn seed_samples(service: &WorkflowService) -> Result<usize> {
    if !service.definitions().await?.is_empty() {
        return Ok(0);
    }

    let mut created = 0;
    for sample in samples() {
        let definition = service
            .create_definition(
                sample.name,
                Some(sample.description.to_string()),
                sample.trigger_key,
                &sample.definition.to_string(),
            )
            .await
            .with_context(|| format!("Failed to seed workflow {}", sample.name))?;
        info!(definition_id = %definition.id, name = sample.name, "Seeded sample workflow");
        created += 1;
    }
    Ok(created)
}
