//! Execution tracking types.
//!
//! `Execution` is the persisted run record the engine owns once a flow is
//! started against a target entity. `NodeExecution` is the append-only audit
//! entry written around every node dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Accumulated execution context: one entry per finished node plus the
/// `last_node` marker.
pub type ExecutionContext = serde_json::Map<String, serde_json::Value>;

/// Context key holding the ID of the most recently finished node.
pub const LAST_NODE_KEY: &str = "last_node";

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Overall status of an execution.
///
/// Moves `Running -> Completed | Failed` and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("invalid execution status: '{other}'")),
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single node execution entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl NodeExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeExecutionStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeExecutionStatus::Running => "running",
            NodeExecutionStatus::Completed => "completed",
            NodeExecutionStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for NodeExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(NodeExecutionStatus::Running),
            "completed" => Ok(NodeExecutionStatus::Completed),
            "failed" => Ok(NodeExecutionStatus::Failed),
            other => Err(format!("invalid node execution status: '{other}'")),
        }
    }
}

impl std::fmt::Display for NodeExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// A single run of a flow against one target entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    /// Flow being executed.
    pub flow_id: Uuid,
    /// Business record the flow runs against.
    pub target_entity_id: Uuid,
    /// Tenant scope.
    pub workspace_id: Uuid,
    /// Node most recently entered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node_id: Option<String>,
    /// Accumulated node outputs keyed by node ID, plus `last_node`.
    #[serde(default)]
    pub context: ExecutionContext,
    pub status: ExecutionStatus,
    /// Optimistic concurrency counter, bumped on every write.
    pub version: i64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Execution {
    /// Create a fresh running execution.
    pub fn new(
        flow_id: Uuid,
        target_entity_id: Uuid,
        workspace_id: Uuid,
        context: ExecutionContext,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            flow_id,
            target_entity_id,
            workspace_id,
            current_node_id: None,
            context,
            status: ExecutionStatus::Running,
            version: 0,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    /// The `last_node` marker, if any node has finished yet.
    pub fn last_node(&self) -> Option<&str> {
        self.context.get(LAST_NODE_KEY).and_then(|v| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// Node Execution (audit log entry)
// ---------------------------------------------------------------------------

/// One attempt at dispatching a node within an execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeExecution {
    /// UUIDv7 entry ID.
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    /// Attempt number (1-based, increments on explicit retry).
    pub attempt: u32,
    pub status: NodeExecutionStatus,
    /// Context snapshot the node was dispatched with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_data: Option<serde_json::Value>,
    /// Output payload produced by the dispatcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_execution_starts_running() {
        let exec = Execution::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            ExecutionContext::new(),
        );
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert_eq!(exec.version, 0);
        assert!(exec.last_node().is_none());
        assert!(exec.completed_at.is_none());
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                json!(status.as_str())
            );
        }
        assert!("paused".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!NodeExecutionStatus::Running.is_terminal());
        assert!(NodeExecutionStatus::Failed.is_terminal());
    }

    #[test]
    fn last_node_reads_marker() {
        let mut ctx = ExecutionContext::new();
        ctx.insert(LAST_NODE_KEY.to_string(), json!("qualify"));
        let exec = Execution::new(Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7(), ctx);
        assert_eq!(exec.last_node(), Some("qualify"));
    }
}
