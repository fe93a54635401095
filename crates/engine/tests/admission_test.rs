//! Admission idempotency under concurrency

mod common;

use std::collections::HashSet;

use serde_json::json;

use common::{context_map, Engine};
use stepflow_engine::domain::{InstanceStatus, TriggerType};
use stepflow_engine::engine::{ServiceError, StartInstance};
use stepflow_engine::persistence::WorkflowStore;

const FLOW: &str = r#"{"name":"orders","trigger":{"type":"webhook"},"steps":[{"id":"d1","type":"delay","delaySeconds":60}]}"#;

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_admissions_yield_one_instance() {
    let engine = Engine::new();
    let definition = engine
        .service
        .create_definition("orders", None, "orders", FLOW)
        .await
        .unwrap();

    let definition_id = definition.id;
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let service = engine.service.clone();
        tasks.push(tokio::spawn(async move {
            service
                .start_instance(StartInstance {
                    definition_id,
                    trigger_type: TriggerType::Webhook,
                    trigger_key: "orders".into(),
                    idempotency_key: "order-42".into(),
                    context: context_map(json!({"order": 42})),
                    correlation_id: None,
                })
                .await
        }));
    }

    let mut ids = HashSet::new();
    for task in tasks {
        ids.insert(task.await.unwrap().unwrap());
    }
    assert_eq!(ids.len(), 1);

    let instances = engine.store.list_instances(None, 100).await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].status, InstanceStatus::Pending);

    // Every duplicate enqueue is absorbed by the executor
    let outcomes = engine.drain().await;
    assert!(!outcomes.is_empty());
    let instance = engine.service.instance(*ids.iter().next().unwrap()).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Waiting);
    assert_eq!(
        engine.service.step_executions(instance.id).await.unwrap().len(),
        1
    );
}

#[test_log::test(tokio::test)]
async fn test_readmission_of_finished_instance_does_not_requeue() {
    let engine = Engine::new();
    let flow = r#"{"name":"once","trigger":{"type":"webhook"},"steps":[{"id":"q1","type":"queue_publish","topic":"t","routingKey":"k","payloadTemplate":"{}"}]}"#;
    engine
        .service
        .create_definition("once", None, "once", flow)
        .await
        .unwrap();

    let first = engine
        .service
        .start_by_trigger("once", "evt-1", Default::default(), None)
        .await
        .unwrap();
    engine.drain().await;

    let again = engine
        .service
        .start_by_trigger("once", "evt-1", Default::default(), None)
        .await
        .unwrap();
    assert_eq!(first, again);
    assert_eq!(engine.queue.try_dequeue(), None);
    assert_eq!(engine.publisher.published().len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_unknown_definition_is_rejected() {
    let engine = Engine::new();
    let err = engine
        .service
        .start_instance(StartInstance {
            definition_id: uuid::Uuid::now_v7(),
            trigger_type: TriggerType::Manual,
            trigger_key: "nope".into(),
            idempotency_key: "k".into(),
            context: Default::default(),
            correlation_id: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::DefinitionNotFound(_)));
}
