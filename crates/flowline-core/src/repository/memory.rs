//! In-memory repository implementations.
//!
//! Provide the same semantics as the SQLite implementations (atomic node
//! claims, version-checked execution updates, scoped entity patches) so the
//! engine can be exercised without a database.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use flowline_types::entity::TargetEntity;
use flowline_types::error::RepositoryError;
use flowline_types::execution::{Execution, ExecutionStatus, NodeExecution, NodeExecutionStatus};
use flowline_types::flow::FlowDefinition;
use uuid::Uuid;

use super::entity::EntityRepository;
use super::flow::{FlowRepository, NodeClaim};

// ---------------------------------------------------------------------------
// InMemoryFlowRepository
// ---------------------------------------------------------------------------

/// DashMap-backed [`FlowRepository`].
#[derive(Default)]
pub struct InMemoryFlowRepository {
    flows: DashMap<Uuid, FlowDefinition>,
    executions: DashMap<Uuid, Execution>,
    /// Node log keyed by `(execution_id, node_id)`; the entry guard makes
    /// claims atomic per pair.
    node_log: DashMap<(Uuid, String), Vec<NodeExecution>>,
    /// Entry ID -> log key, for `finish_node_execution`.
    node_index: DashMap<Uuid, (Uuid, String)>,
    /// Number of upcoming `update_execution` calls to fail with a query error.
    failing_updates: AtomicU32,
}

impl InMemoryFlowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` execution updates fail as if the store were
    /// unavailable.
    pub fn fail_next_updates(&self, count: u32) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl FlowRepository for InMemoryFlowRepository {
    async fn save_flow(&self, flow: &FlowDefinition) -> Result<(), RepositoryError> {
        self.flows.insert(flow.id, flow.clone());
        Ok(())
    }

    async fn get_flow(&self, id: &Uuid) -> Result<Option<FlowDefinition>, RepositoryError> {
        Ok(self.flows.get(id).map(|f| f.clone()))
    }

    async fn list_flows(
        &self,
        workspace_id: Option<&Uuid>,
    ) -> Result<Vec<FlowDefinition>, RepositoryError> {
        let mut flows: Vec<FlowDefinition> = self
            .flows
            .iter()
            .filter(|f| workspace_id.is_none_or(|ws| f.workspace_id == *ws))
            .map(|f| f.clone())
            .collect();
        flows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(flows)
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        if self.executions.contains_key(&execution.id) {
            return Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        self.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        Ok(self.executions.get(id).map(|e| e.clone()))
    }

    async fn update_execution(
        &self,
        execution: &Execution,
        expected_version: i64,
    ) -> Result<(), RepositoryError> {
        if self.take_injected_failure() {
            return Err(RepositoryError::Query("injected write failure".to_string()));
        }
        let mut stored = self
            .executions
            .get_mut(&execution.id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.version != expected_version {
            return Err(RepositoryError::Conflict(format!(
                "execution {} at version {}, expected {expected_version}",
                execution.id, stored.version
            )));
        }
        *stored = execution.clone();
        Ok(())
    }

    async fn list_executions_by_status(
        &self,
        status: ExecutionStatus,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let mut found: Vec<Execution> = self
            .executions
            .iter()
            .filter(|e| e.status == status)
            .map(|e| e.clone())
            .collect();
        found.sort_by_key(|e| e.started_at);
        Ok(found)
    }

    async fn list_executions(
        &self,
        flow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let mut found: Vec<Execution> = self
            .executions
            .iter()
            .filter(|e| e.flow_id == *flow_id)
            .map(|e| e.clone())
            .collect();
        found.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        found.truncate(limit as usize);
        Ok(found)
    }

    async fn claim_node_execution(
        &self,
        entry: &NodeExecution,
        allow_after_failure: bool,
    ) -> Result<NodeClaim, RepositoryError> {
        let key = (entry.execution_id, entry.node_id.clone());
        let mut attempts = self.node_log.entry(key.clone()).or_default();

        let blocking = attempts.iter().rev().find(|e| match e.status {
            NodeExecutionStatus::Running | NodeExecutionStatus::Completed => true,
            NodeExecutionStatus::Failed => !allow_after_failure,
        });
        if let Some(existing) = blocking {
            return Ok(NodeClaim::Existing(existing.clone()));
        }

        attempts.push(entry.clone());
        self.node_index.insert(entry.id, key);
        Ok(NodeClaim::Claimed)
    }

    async fn finish_node_execution(
        &self,
        id: &Uuid,
        status: NodeExecutionStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let key = self
            .node_index
            .get(id)
            .map(|k| k.clone())
            .ok_or(RepositoryError::NotFound)?;
        let mut attempts = self.node_log.get_mut(&key).ok_or(RepositoryError::NotFound)?;
        let entry = attempts
            .iter_mut()
            .find(|e| e.id == *id && e.status == NodeExecutionStatus::Running)
            .ok_or(RepositoryError::NotFound)?;

        entry.status = status;
        entry.output_data = output.cloned();
        entry.error_message = error.map(String::from);
        entry.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn list_node_executions(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<NodeExecution>, RepositoryError> {
        let mut entries: Vec<NodeExecution> = self
            .node_log
            .iter()
            .filter(|kv| kv.key().0 == *execution_id)
            .flat_map(|kv| kv.value().clone())
            .collect();
        entries.sort_by_key(|e| (e.started_at, e.id));
        Ok(entries)
    }

    async fn latest_node_execution(
        &self,
        execution_id: &Uuid,
        node_id: &str,
    ) -> Result<Option<NodeExecution>, RepositoryError> {
        Ok(self
            .node_log
            .get(&(*execution_id, node_id.to_string()))
            .and_then(|attempts| attempts.last().cloned()))
    }
}

// ---------------------------------------------------------------------------
// InMemoryEntityRepository
// ---------------------------------------------------------------------------

/// DashMap-backed [`EntityRepository`] that counts applied patches.
#[derive(Default)]
pub struct InMemoryEntityRepository {
    entities: DashMap<Uuid, TargetEntity>,
    patches_applied: AtomicU32,
}

impl InMemoryEntityRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `patch_fields` calls that modified an entity.
    pub fn patches_applied(&self) -> u32 {
        self.patches_applied.load(Ordering::SeqCst)
    }
}

impl EntityRepository for InMemoryEntityRepository {
    async fn save_entity(&self, entity: &TargetEntity) -> Result<(), RepositoryError> {
        self.entities.insert(entity.id, entity.clone());
        Ok(())
    }

    async fn get_entity(
        &self,
        workspace_id: &Uuid,
        id: &Uuid,
    ) -> Result<Option<TargetEntity>, RepositoryError> {
        Ok(self
            .entities
            .get(id)
            .filter(|e| e.workspace_id == *workspace_id)
            .map(|e| e.clone()))
    }

    async fn patch_fields(
        &self,
        workspace_id: &Uuid,
        id: &Uuid,
        patch: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<bool, RepositoryError> {
        let Some(mut entity) = self.entities.get_mut(id) else {
            return Ok(false);
        };
        if entity.workspace_id != *workspace_id {
            return Ok(false);
        }
        for (key, value) in patch {
            entity.fields.insert(key.clone(), value.clone());
        }
        entity.updated_at = Utc::now();
        self.patches_applied.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_types::execution::ExecutionContext;
    use serde_json::json;

    fn running_entry(execution_id: Uuid, node_id: &str, attempt: u32) -> NodeExecution {
        NodeExecution {
            id: Uuid::now_v7(),
            execution_id,
            node_id: node_id.to_string(),
            node_type: "ai_step".to_string(),
            attempt,
            status: NodeExecutionStatus::Running,
            input_data: None,
            output_data: None,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn claim_blocks_while_running_and_after_completion() {
        let repo = InMemoryFlowRepository::new();
        let exec_id = Uuid::now_v7();

        let first = running_entry(exec_id, "a", 1);
        assert_eq!(
            repo.claim_node_execution(&first, false).await.unwrap(),
            NodeClaim::Claimed
        );

        let second = running_entry(exec_id, "a", 1);
        match repo.claim_node_execution(&second, true).await.unwrap() {
            NodeClaim::Existing(e) => assert_eq!(e.id, first.id),
            NodeClaim::Claimed => panic!("running entry must block"),
        }

        repo.finish_node_execution(&first.id, NodeExecutionStatus::Completed, Some(&json!({})), None)
            .await
            .unwrap();
        assert!(matches!(
            repo.claim_node_execution(&second, true).await.unwrap(),
            NodeClaim::Existing(_)
        ));
    }

    #[tokio::test]
    async fn failed_entry_blocks_unless_retry() {
        let repo = InMemoryFlowRepository::new();
        let exec_id = Uuid::now_v7();
        let first = running_entry(exec_id, "a", 1);
        repo.claim_node_execution(&first, false).await.unwrap();
        repo.finish_node_execution(&first.id, NodeExecutionStatus::Failed, None, Some("boom"))
            .await
            .unwrap();

        let retry = running_entry(exec_id, "a", 2);
        assert!(matches!(
            repo.claim_node_execution(&retry, false).await.unwrap(),
            NodeClaim::Existing(_)
        ));
        assert_eq!(
            repo.claim_node_execution(&retry, true).await.unwrap(),
            NodeClaim::Claimed
        );

        let latest = repo.latest_node_execution(&exec_id, "a").await.unwrap().unwrap();
        assert_eq!(latest.attempt, 2);
        assert_eq!(repo.list_node_executions(&exec_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn finish_is_not_reapplied() {
        let repo = InMemoryFlowRepository::new();
        let entry = running_entry(Uuid::now_v7(), "a", 1);
        repo.claim_node_execution(&entry, false).await.unwrap();
        repo.finish_node_execution(&entry.id, NodeExecutionStatus::Completed, None, None)
            .await
            .unwrap();
        let again = repo
            .finish_node_execution(&entry.id, NodeExecutionStatus::Failed, None, Some("late"))
            .await;
        assert!(matches!(again, Err(RepositoryError::NotFound)));
    }

    #[tokio::test]
    async fn update_execution_checks_version() {
        let repo = InMemoryFlowRepository::new();
        let mut exec = Execution::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            ExecutionContext::new(),
        );
        repo.create_execution(&exec).await.unwrap();

        exec.version = 1;
        repo.update_execution(&exec, 0).await.unwrap();

        exec.version = 2;
        let stale = repo.update_execution(&exec, 0).await;
        assert!(matches!(stale, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn patch_fields_is_workspace_scoped() {
        let repo = InMemoryEntityRepository::new();
        let ws = Uuid::now_v7();
        let entity = TargetEntity {
            id: Uuid::now_v7(),
            workspace_id: ws,
            fields: json!({"name": "Ada", "status": "new"}).as_object().unwrap().clone(),
            updated_at: Utc::now(),
        };
        repo.save_entity(&entity).await.unwrap();

        let patch = json!({"status": "contacted"}).as_object().unwrap().clone();
        assert!(!repo.patch_fields(&Uuid::now_v7(), &entity.id, &patch).await.unwrap());
        assert!(repo.patch_fields(&ws, &entity.id, &patch).await.unwrap());

        let stored = repo.get_entity(&ws, &entity.id).await.unwrap().unwrap();
        assert_eq!(stored.fields["status"], "contacted");
        assert_eq!(stored.fields["name"], "Ada");
        assert_eq!(repo.patches_applied(), 1);
    }
}
