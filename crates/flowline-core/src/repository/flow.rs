//! Flow repository trait definition.
//!
//! Defines the storage interface for flow definitions, execution records
//! and the node execution log. The infrastructure layer (flowline-infra)
//! implements this trait with SQLite persistence.

use flowline_types::error::RepositoryError;
use flowline_types::execution::{Execution, ExecutionStatus, NodeExecution, NodeExecutionStatus};
use flowline_types::flow::FlowDefinition;
use uuid::Uuid;

/// Result of an atomic claim on `(execution, node)` in the node log.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeClaim {
    /// The new entry was inserted; the caller owns this attempt.
    Claimed,
    /// A blocking entry already exists. Carries the most recent one.
    Existing(NodeExecution),
}

/// Repository trait for flow persistence.
///
/// Covers three entity families:
/// - **Flows:** registration and lookup of immutable flow graphs.
/// - **Executions:** create/load and version-checked updates of run records.
/// - **Node log:** claim/finish/query of per-node execution entries.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait FlowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Flows
    // -----------------------------------------------------------------------

    /// Upsert a flow definition (insert or replace by ID).
    fn save_flow(
        &self,
        flow: &FlowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a flow definition by its UUID.
    fn get_flow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<FlowDefinition>, RepositoryError>> + Send;

    /// List flows, optionally filtered by workspace, ordered by name.
    fn list_flows(
        &self,
        workspace_id: Option<&Uuid>,
    ) -> impl std::future::Future<Output = Result<Vec<FlowDefinition>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Create a new execution record.
    fn create_execution(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an execution by its UUID.
    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// Overwrite the mutable columns of an execution if its stored version
    /// still equals `expected_version`.
    ///
    /// Returns `Conflict` when the version moved and `NotFound` when the row
    /// is gone. The stored version becomes `execution.version`.
    fn update_execution(
        &self,
        execution: &Execution,
        expected_version: i64,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List executions in the given status, oldest first.
    fn list_executions_by_status(
        &self,
        status: ExecutionStatus,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    /// List executions of a flow, newest first.
    fn list_executions(
        &self,
        flow_id: &Uuid,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Node log
    // -----------------------------------------------------------------------

    /// Atomically insert `entry` unless a blocking entry exists for
    /// `(entry.execution_id, entry.node_id)`.
    ///
    /// `running` and `completed` entries always block. `failed` entries
    /// block unless `allow_after_failure` is set.
    fn claim_node_execution(
        &self,
        entry: &NodeExecution,
        allow_after_failure: bool,
    ) -> impl std::future::Future<Output = Result<NodeClaim, RepositoryError>> + Send;

    /// Finalize a running entry. Entries that are already terminal are left
    /// untouched and `NotFound` is returned.
    fn finish_node_execution(
        &self,
        id: &Uuid,
        status: NodeExecutionStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All entries for an execution, ordered by start time.
    fn list_node_executions(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<NodeExecution>, RepositoryError>> + Send;

    /// Most recent entry for `(execution, node)`, if any.
    fn latest_node_execution(
        &self,
        execution_id: &Uuid,
        node_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<NodeExecution>, RepositoryError>> + Send;
}
