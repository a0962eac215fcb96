//! Node execution log.
//!
//! Brackets every dispatch with exactly one `begin`/`finish` pair. `begin`
//! doubles as the idempotency fence: it atomically claims the
//! `(execution, node)` pair and hands back the blocking entry when a claim
//! is refused.

use std::sync::Arc;

use chrono::Utc;
use flowline_types::execution::{NodeExecution, NodeExecutionStatus};
use flowline_types::flow::NodeDefinition;
use serde_json::Value;
use uuid::Uuid;

use super::store::StoreError;
use crate::repository::flow::{FlowRepository, NodeClaim};

/// Error message written onto an entry replaced by an explicit retry.
pub const SUPERSEDED_BY_RETRY: &str = "superseded by retry";

/// Result of [`NodeLog::begin`].
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// A fresh running entry was written; dispatch may proceed.
    Started(NodeExecution),
    /// Another entry blocks the claim.
    Existing(NodeExecution),
}

pub struct NodeLog<R: FlowRepository> {
    repo: Arc<R>,
}

impl<R: FlowRepository> NodeLog<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Claim `node` for a new attempt.
    ///
    /// `running` and `completed` entries always block; `failed` entries
    /// block unless `is_retry`.
    pub async fn begin(
        &self,
        execution_id: Uuid,
        node: &NodeDefinition,
        input: &Value,
        is_retry: bool,
    ) -> Result<BeginOutcome, StoreError> {
        let attempt = self
            .repo
            .latest_node_execution(&execution_id, &node.id)
            .await?
            .map_or(1, |latest| latest.attempt + 1);

        let entry = NodeExecution {
            id: Uuid::now_v7(),
            execution_id,
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            attempt,
            status: NodeExecutionStatus::Running,
            input_data: Some(input.clone()),
            output_data: None,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        };

        match self.repo.claim_node_execution(&entry, is_retry).await? {
            NodeClaim::Claimed => {
                tracing::debug!(
                    execution_id = %execution_id,
                    node_id = node.id.as_str(),
                    attempt,
                    log_id = %entry.id,
                    "node execution started"
                );
                Ok(BeginOutcome::Started(entry))
            }
            NodeClaim::Existing(existing) => Ok(BeginOutcome::Existing(existing)),
        }
    }

    /// Finalize an entry with the dispatch outcome.
    pub async fn finish(
        &self,
        log_id: Uuid,
        success: bool,
        output: &Value,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let status = if success {
            NodeExecutionStatus::Completed
        } else {
            NodeExecutionStatus::Failed
        };
        self.repo
            .finish_node_execution(&log_id, status, Some(output), error)
            .await?;
        tracing::debug!(log_id = %log_id, status = status.as_str(), "node execution finished");
        Ok(())
    }

    /// Mark a stale running entry failed so a retry can claim the node.
    pub async fn supersede(&self, entry: &NodeExecution) -> Result<(), StoreError> {
        match self
            .repo
            .finish_node_execution(
                &entry.id,
                NodeExecutionStatus::Failed,
                None,
                Some(SUPERSEDED_BY_RETRY),
            )
            .await
        {
            // Finished concurrently; the claim that follows sees the result.
            Ok(()) | Err(flowline_types::error::RepositoryError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn entries(&self, execution_id: Uuid) -> Result<Vec<NodeExecution>, StoreError> {
        Ok(self.repo.list_node_executions(&execution_id).await?)
    }

    pub async fn latest(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeExecution>, StoreError> {
        Ok(self.repo.latest_node_execution(&execution_id, node_id).await?)
    }
}
