//! In-memory implementation of WorkflowStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::domain::{
    DeadLetterMessage, InstanceStatus, OutboxMessage, StepExecution, StepStatus,
    WorkflowDefinition, WorkflowInstance, WorkflowVersion,
};

#[derive(Default)]
struct State {
    definitions: HashMap<Uuid, WorkflowDefinition>,
    versions: HashMap<(Uuid, i32), WorkflowVersion>,
    instances: HashMap<Uuid, WorkflowInstance>,
    /// (trigger key, idempotency key) -> instance id
    idempotency_index: HashMap<(String, String), Uuid>,
    steps: Vec<StepExecution>,
    dead_letters: Vec<DeadLetterMessage>,
    outbox: Vec<OutboxMessage>,
}

/// In-memory implementation of WorkflowStore
///
/// All tables live behind one lock, so a [`Checkpoint`] commits atomically
/// just like the PostgreSQL transaction does.
///
/// # Example
///
/// ```
/// use stepflow_engine::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// ```
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    state: RwLock<State>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every outbox row, published or not, in insertion order
    pub fn outbox_messages(&self) -> Vec<OutboxMessage> {
        self.state.read().outbox.clone()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create_definition(
        &self,
        definition: &WorkflowDefinition,
        version: &WorkflowVersion,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.definitions.contains_key(&definition.id) {
            return Err(StoreError::Database(format!(
                "definition {} already exists",
                definition.id
            )));
        }
        state.definitions.insert(definition.id, definition.clone());
        state
            .versions
            .insert((version.definition_id, version.version_number), version.clone());
        Ok(())
    }

    async fn append_version(&self, version: &WorkflowVersion) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let definition = state
            .definitions
            .get_mut(&version.definition_id)
            .ok_or(StoreError::DefinitionNotFound(version.definition_id))?;

        if definition.current_version + 1 != version.version_number {
            return Err(StoreError::ConcurrencyConflict {
                id: version.definition_id,
                expected: i64::from(version.version_number - 1),
                actual: i64::from(definition.current_version),
            });
        }

        definition.current_version = version.version_number;
        state
            .versions
            .insert((version.definition_id, version.version_number), version.clone());
        Ok(())
    }

    async fn get_definition(&self, id: Uuid) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.state.read().definitions.get(&id).cloned())
    }

    async fn find_definition_by_trigger(
        &self,
        trigger_key: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self
            .state
            .read()
            .definitions
            .values()
            .find(|d| d.trigger_key == trigger_key)
            .cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let mut defs: Vec<_> = self.state.read().definitions.values().cloned().collect();
        defs.sort_by_key(|d| d.created_at);
        Ok(defs)
    }

    async fn get_version(
        &self,
        definition_id: Uuid,
        version_number: i32,
    ) -> Result<Option<WorkflowVersion>, StoreError> {
        Ok(self
            .state
            .read()
            .versions
            .get(&(definition_id, version_number))
            .cloned())
    }

    async fn list_versions(
        &self,
        definition_id: Uuid,
    ) -> Result<Vec<WorkflowVersion>, StoreError> {
        let mut versions: Vec<_> = self
            .state
            .read()
            .versions
            .values()
            .filter(|v| v.definition_id == definition_id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.version_number);
        Ok(versions)
    }

    async fn insert_instance(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let key = (
            instance.trigger_key.clone(),
            instance.idempotency_key.clone(),
        );
        if state.idempotency_index.contains_key(&key) {
            return Err(StoreError::DuplicateInstance {
                trigger_key: key.0,
                idempotency_key: key.1,
            });
        }

        state.idempotency_index.insert(key, instance.id);
        state.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self.state.read().instances.get(&id).cloned())
    }

    async fn find_instance_by_idempotency(
        &self,
        trigger_key: &str,
        idempotency_key: &str,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        let state = self.state.read();
        Ok(state
            .idempotency_index
            .get(&(trigger_key.to_string(), idempotency_key.to_string()))
            .and_then(|id| state.instances.get(id))
            .cloned())
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: usize,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let mut instances: Vec<_> = self
            .state
            .read()
            .instances
            .values()
            .filter(|i| status.map_or(true, |s| i.status == s))
            .cloned()
            .collect();
        instances.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        instances.truncate(limit);
        Ok(instances)
    }

    async fn due_instances(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let state = self.state.read();
        let mut due: Vec<_> = state
            .instances
            .values()
            .filter(|i| matches!(i.status, InstanceStatus::Waiting | InstanceStatus::Pending))
            .filter_map(|i| i.next_run_at.filter(|at| *at <= now).map(|at| (at, i.id)))
            .collect();
        due.sort();
        Ok(due.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn stale_running_instances(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let state = self.state.read();
        let mut stale: Vec<_> = state
            .instances
            .values()
            .filter(|i| i.status == InstanceStatus::Running)
            .filter_map(|i| {
                i.started_at
                    .filter(|at| *at < started_before)
                    .map(|at| (at, i.id))
            })
            .collect();
        stale.sort();
        Ok(stale.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn count_step_attempts(
        &self,
        instance_id: Uuid,
        step_id: &str,
    ) -> Result<u32, StoreError> {
        Ok(self
            .state
            .read()
            .steps
            .iter()
            .filter(|s| s.instance_id == instance_id && s.step_id == step_id)
            .count() as u32)
    }

    async fn list_step_executions(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<StepExecution>, StoreError> {
        let mut steps: Vec<_> = self
            .state
            .read()
            .steps
            .iter()
            .filter(|s| s.instance_id == instance_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        Ok(steps)
    }

    async fn latest_failed_step(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<StepExecution>, StoreError> {
        Ok(self
            .state
            .read()
            .steps
            .iter()
            .filter(|s| s.instance_id == instance_id && s.status == StepStatus::Failed)
            .max_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn list_dead_letters(
        &self,
        instance_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<DeadLetterMessage>, StoreError> {
        let mut letters: Vec<_> = self
            .state
            .read()
            .dead_letters
            .iter()
            .filter(|d| instance_id.map_or(true, |id| d.instance_id == id))
            .cloned()
            .collect();
        letters.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        letters.truncate(limit);
        Ok(letters)
    }

    async fn commit(&self, checkpoint: Checkpoint<'_>) -> Result<i64, StoreError> {
        let mut state = self.state.write();
        let incoming = checkpoint.instance;

        let stored = state
            .instances
            .get_mut(&incoming.id)
            .ok_or(StoreError::InstanceNotFound(incoming.id))?;

        if stored.row_version != incoming.row_version {
            return Err(StoreError::ConcurrencyConflict {
                id: incoming.id,
                expected: incoming.row_version,
                actual: stored.row_version,
            });
        }

        let new_version = incoming.row_version + 1;
        *stored = incoming.clone();
        stored.row_version = new_version;

        if let Some(step) = checkpoint.step_execution {
            match state.steps.iter_mut().find(|s| s.id == step.id) {
                Some(existing) => *existing = step.clone(),
                None => state.steps.push(step.clone()),
            }
        }

        if let Some(letter) = checkpoint.dead_letter {
            state.dead_letters.push(letter.clone());
        }

        state.outbox.extend(checkpoint.outbox);
        Ok(new_version)
    }

    async fn pending_outbox(
        &self,
        max_attempts: i32,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let mut pending: Vec<_> = self
            .state
            .read()
            .outbox
            .iter()
            .filter(|m| m.published_at.is_none() && m.attempts < max_attempts)
            .cloned()
            .collect();
        pending.sort_by_key(|m| m.occurred_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_outbox_published(
        &self,
        id: Uuid,
        published_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if let Some(message) = state.outbox.iter_mut().find(|m| m.id == id) {
            message.published_at = Some(published_at);
            message.last_error = None;
        }
        Ok(())
    }

    async fn mark_outbox_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if let Some(message) = state.outbox.iter_mut().find(|m| m.id == id) {
            message.attempts += 1;
            message.last_error = Some(error.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ContextMap, NewInstance, TriggerType};
    use crate::dsl::StepKind;
    use chrono::Duration;

    fn new_instance(key: &str) -> WorkflowInstance {
        WorkflowInstance::new(
            NewInstance {
                definition_id: Uuid::now_v7(),
                version_number: 1,
                trigger_type: TriggerType::Manual,
                trigger_key: "orders".into(),
                idempotency_key: key.into(),
                correlation_id: "c".into(),
                context: ContextMap::new(),
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_duplicate_instance_rejected() {
        let store = InMemoryWorkflowStore::new();
        store.insert_instance(&new_instance("k1")).await.unwrap();

        let err = store.insert_instance(&new_instance("k1")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateInstance { .. }));
        store.insert_instance(&new_instance("k2")).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_checks_row_version() {
        let store = InMemoryWorkflowStore::new();
        let mut inst = new_instance("k1");
        store.insert_instance(&inst).await.unwrap();

        let stale = inst.clone();
        inst.start(Utc::now()).unwrap();
        let outbox = OutboxMessage::new("WorkflowInstanceStarted", serde_json::json!({}), Utc::now());
        inst.row_version = store
            .commit(Checkpoint::new(&inst).with_events([outbox]))
            .await
            .unwrap();
        assert_eq!(inst.row_version, 1);

        let err = store.commit(Checkpoint::new(&stale)).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::ConcurrencyConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));
        assert_eq!(store.outbox_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_step_rows_upsert_and_latest_failed() {
        let store = InMemoryWorkflowStore::new();
        let mut inst = new_instance("k1");
        store.insert_instance(&inst).await.unwrap();

        let now = Utc::now();
        let mut first = StepExecution::new(inst.id, "call", StepKind::Http, 0, None, now);
        first.start_attempt(now);
        inst.row_version = store.commit(Checkpoint::new(&inst).with_step(&first)).await.unwrap();
        first.fail(now, "HTTP 500");
        inst.row_version = store.commit(Checkpoint::new(&inst).with_step(&first)).await.unwrap();

        let later = now + Duration::seconds(1);
        let mut second = StepExecution::new(inst.id, "call", StepKind::Http, 1, None, later);
        second.start_attempt(later);
        second.fail(later, "HTTP 502");
        store.commit(Checkpoint::new(&inst).with_step(&second)).await.unwrap();

        assert_eq!(store.count_step_attempts(inst.id, "call").await.unwrap(), 2);
        let latest = store.latest_failed_step(inst.id).await.unwrap().unwrap();
        assert_eq!(latest.error.as_deref(), Some("HTTP 502"));
    }

    #[tokio::test]
    async fn test_due_and_stale_queries() {
        let store = InMemoryWorkflowStore::new();
        let now = Utc::now();

        let mut waiting = new_instance("w");
        waiting.mark_waiting(now - Duration::seconds(1));
        let mut future = new_instance("f");
        future.mark_waiting(now + Duration::seconds(60));
        let mut running = new_instance("r");
        running.start(now - Duration::minutes(10)).unwrap();

        for inst in [&waiting, &future, &running] {
            store.insert_instance(inst).await.unwrap();
        }

        assert_eq!(store.due_instances(now, 100).await.unwrap(), vec![waiting.id]);
        assert_eq!(
            store
                .stale_running_instances(now - Duration::minutes(5), 100)
                .await
                .unwrap(),
            vec![running.id]
        );
    }

    #[tokio::test]
    async fn test_outbox_lifecycle() {
        let store = InMemoryWorkflowStore::new();
        let inst = new_instance("k1");
        store.insert_instance(&inst).await.unwrap();

        let now = Utc::now();
        let a = OutboxMessage::new("A", serde_json::json!({}), now);
        let b = OutboxMessage::new("B", serde_json::json!({}), now + Duration::seconds(1));
        let (a_id, b_id) = (a.id, b.id);
        store
            .commit(Checkpoint::new(&inst).with_events([b, a]))
            .await
            .unwrap();

        let pending = store.pending_outbox(2, 10).await.unwrap();
        assert_eq!(pending.iter().map(|m| m.id).collect::<Vec<_>>(), vec![a_id, b_id]);

        store.mark_outbox_published(a_id, now).await.unwrap();
        store.mark_outbox_failed(b_id, "broker down").await.unwrap();
        store.mark_outbox_failed(b_id, "broker down").await.unwrap();

        assert!(store.pending_outbox(2, 10).await.unwrap().is_empty());
        assert_eq!(store.pending_outbox(3, 10).await.unwrap().len(), 1);
    }
}
