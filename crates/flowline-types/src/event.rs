//! Event types for the Flowline event bus.
//!
//! `FlowEvent` is broadcast at every execution state transition. All
//! variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted while executions advance through their flows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    /// An execution was created and its entry node scheduled.
    ExecutionStarted {
        execution_id: Uuid,
        flow_id: Uuid,
        target_entity_id: Uuid,
    },

    /// A node dispatch began.
    NodeStarted {
        execution_id: Uuid,
        node_id: String,
        node_type: String,
        attempt: u32,
    },

    /// A node dispatch finished with `success = true`.
    NodeCompleted {
        execution_id: Uuid,
        node_id: String,
        duration_ms: u64,
    },

    /// A node dispatch finished with `success = false`. Traversal continues.
    NodeFailed {
        execution_id: Uuid,
        node_id: String,
        error: String,
    },

    /// A redelivered continuation was fenced off by the node log.
    NodeSkipped {
        execution_id: Uuid,
        node_id: String,
        reason: String,
    },

    /// The last live branch terminated.
    ExecutionCompleted { execution_id: Uuid },

    /// The execution hit a fatal error.
    ExecutionFailed { execution_id: Uuid, error: String },
}

impl FlowEvent {
    pub fn execution_id(&self) -> Uuid {
        match self {
            FlowEvent::ExecutionStarted { execution_id, .. }
            | FlowEvent::NodeStarted { execution_id, .. }
            | FlowEvent::NodeCompleted { execution_id, .. }
            | FlowEvent::NodeFailed { execution_id, .. }
            | FlowEvent::NodeSkipped { execution_id, .. }
            | FlowEvent::ExecutionCompleted { execution_id }
            | FlowEvent::ExecutionFailed { execution_id, .. } => *execution_id,
        }
    }
}
