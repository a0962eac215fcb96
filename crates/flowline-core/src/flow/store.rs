//! Execution context store.
//!
//! Loads execution records and applies merge patches under optimistic
//! concurrency: read the record, apply the patch, write it back only if the
//! version is unchanged, and re-apply on conflict up to a bounded number of
//! times.

use std::sync::Arc;

use flowline_types::error::RepositoryError;
use flowline_types::execution::{Execution, ExecutionStatus};
use uuid::Uuid;

use super::context::ContextPatch;
use crate::repository::flow::FlowRepository;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from the execution store and node log.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Gave up re-applying after repeated version conflicts.
    #[error("execution {execution_id} kept changing; gave up after {attempts} attempts")]
    Conflict { execution_id: Uuid, attempts: u32 },

    #[error("store error: {0}")]
    Repository(#[from] RepositoryError),
}

impl StoreError {
    /// Write failures and exhausted conflicts may succeed on redelivery.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::ExecutionNotFound(_) => false,
            StoreError::Conflict { .. } => true,
            StoreError::Repository(e) => e.is_transient(),
        }
    }
}

/// Outcome of a successful update.
#[derive(Debug, Clone)]
pub struct StoreUpdate {
    /// Status the record had right before this write.
    pub previous: ExecutionStatus,
    /// The record as written.
    pub execution: Execution,
}

impl StoreUpdate {
    /// Whether this write moved the record into `status`.
    pub fn entered(&self, status: ExecutionStatus) -> bool {
        self.previous != status && self.execution.status == status
    }
}

// ---------------------------------------------------------------------------
// ExecutionStore
// ---------------------------------------------------------------------------

pub struct ExecutionStore<R: FlowRepository> {
    repo: Arc<R>,
    max_retries: u32,
}

impl<R: FlowRepository> ExecutionStore<R> {
    pub fn new(repo: Arc<R>, max_retries: u32) -> Self {
        Self { repo, max_retries }
    }

    pub async fn create(&self, execution: &Execution) -> Result<(), StoreError> {
        self.repo.create_execution(execution).await?;
        Ok(())
    }

    pub async fn load(&self, execution_id: Uuid) -> Result<Execution, StoreError> {
        self.repo
            .get_execution(&execution_id)
            .await?
            .ok_or(StoreError::ExecutionNotFound(execution_id))
    }

    /// Apply `patch` atomically.
    pub async fn update(
        &self,
        execution_id: Uuid,
        patch: &ContextPatch,
    ) -> Result<StoreUpdate, StoreError> {
        self.update_with(execution_id, |current| patch.apply(current))
            .await
    }

    /// Apply an arbitrary pure transition atomically. `transition` may run
    /// several times, once per conflicting attempt.
    pub async fn update_with<F>(
        &self,
        execution_id: Uuid,
        transition: F,
    ) -> Result<StoreUpdate, StoreError>
    where
        F: Fn(&Execution) -> Execution + Send + Sync,
    {
        let attempts = self.max_retries.saturating_add(1);
        for attempt in 1..=attempts {
            let current = self.load(execution_id).await?;
            let mut next = transition(&current);
            next.version = current.version + 1;

            match self.repo.update_execution(&next, current.version).await {
                Ok(()) => {
                    return Ok(StoreUpdate {
                        previous: current.status,
                        execution: next,
                    });
                }
                Err(RepositoryError::Conflict(reason)) => {
                    tracing::debug!(
                        execution_id = %execution_id,
                        attempt,
                        reason = reason.as_str(),
                        "execution version conflict, re-applying patch"
                    );
                }
                Err(RepositoryError::NotFound) => {
                    return Err(StoreError::ExecutionNotFound(execution_id));
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::warn!(
            execution_id = %execution_id,
            attempts,
            "execution update abandoned after repeated conflicts"
        );
        Err(StoreError::Conflict {
            execution_id,
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryFlowRepository;
    use flowline_types::execution::ExecutionContext;
    use serde_json::json;

    async fn seeded() -> (Arc<InMemoryFlowRepository>, Execution) {
        let repo = Arc::new(InMemoryFlowRepository::new());
        let exec = Execution::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            ExecutionContext::new(),
        );
        repo.create_execution(&exec).await.unwrap();
        (repo, exec)
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_reports_previous_status() {
        let (repo, exec) = seeded().await;
        let store = ExecutionStore::new(repo, 3);

        let update = store
            .update(exec.id, &ContextPatch::node_finished("a", json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(update.previous, ExecutionStatus::Running);
        assert_eq!(update.execution.version, 1);

        let loaded = store.load(exec.id).await.unwrap();
        assert_eq!(loaded.context["a"], json!({"ok": true}));
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_conflict_is_reapplied_on_fresh_state() {
        let (repo, exec) = seeded().await;
        let store = ExecutionStore::new(repo.clone(), 3);

        // A concurrent writer lands between our read and write exactly once.
        let interfered = std::sync::atomic::AtomicBool::new(false);
        let update = store
            .update_with(exec.id, |current| {
                if !interfered.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    let mut other = ContextPatch::node_finished("b", json!(2)).apply(current);
                    other.version = current.version + 1;
                    // Bypass the store to simulate another process.
                    let _ = futures_util::FutureExt::now_or_never(
                        repo.update_execution(&other, current.version),
                    );
                }
                ContextPatch::node_finished("a", json!(1)).apply(current)
            })
            .await
            .unwrap();

        assert_eq!(update.execution.context["a"], json!(1));
        assert_eq!(update.execution.context["b"], json!(2));
        assert_eq!(update.execution.version, 2);
    }

    #[tokio::test]
    async fn test_write_failure_is_retryable() {
        let (repo, exec) = seeded().await;
        repo.fail_next_updates(1);
        let store = ExecutionStore::new(repo, 3);

        let patch = ContextPatch::node_finished("a", json!(1));
        let err = store.update(exec.id, &patch).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.update(exec.id, &patch).await.is_ok());
    }

    #[tokio::test]
    async fn test_unbounded_retry_setting_still_writes() {
        let (repo, exec) = seeded().await;
        let store = ExecutionStore::new(repo, u32::MAX);

        let update = store
            .update(exec.id, &ContextPatch::node_finished("a", json!(1)))
            .await
            .unwrap();
        assert_eq!(update.execution.version, 1);
    }

    #[tokio::test]
    async fn test_missing_execution_is_not_retryable() {
        let store = ExecutionStore::new(Arc::new(InMemoryFlowRepository::new()), 3);
        let err = store.load(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, StoreError::ExecutionNotFound(_)));
        assert!(!err.is_retryable());
    }
}
