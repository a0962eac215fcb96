//! Flow graph domain types for Flowline.
//!
//! A flow is pure data: a set of typed nodes and directed edges, optionally
//! labelled with a branch tag. Flows are immutable for the lifetime of any
//! execution that runs against them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Flow Definition
// ---------------------------------------------------------------------------

/// A registered flow: the graph an execution walks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowDefinition {
    /// UUIDv7 assigned on registration.
    pub id: Uuid,
    /// Tenant that owns this flow.
    pub workspace_id: Uuid,
    /// Human-readable flow name.
    pub name: String,
    /// Default system instruction handed to AI steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_persona: Option<String>,
    /// Typed steps.
    pub nodes: Vec<NodeDefinition>,
    /// Directed edges between nodes.
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
    /// When the flow was registered.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl FlowDefinition {
    /// Look up a node by its ID.
    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// All edges leaving `node_id`, in declaration order.
    pub fn outgoing(&self, node_id: &str) -> impl Iterator<Item = &EdgeDefinition> {
        self.edges.iter().filter(move |e| e.source == node_id)
    }
}

/// A single typed step in a flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeDefinition {
    /// Flow-local node ID (e.g. "qualify-lead"). Unique within a flow.
    pub id: String,
    /// Raw node type string. Interpreted by the dispatcher; unknown types
    /// are tolerated and run as pass-through.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Type-specific configuration payload.
    #[serde(default = "empty_config")]
    pub config: serde_json::Value,
}

fn empty_config() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// A directed edge. An edge without `branch` is unconditional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EdgeDefinition {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl EdgeDefinition {
    /// Whether this edge is followed for a node output carrying `branch`.
    ///
    /// Unconditional edges always match; labelled edges match only an equal
    /// branch selector.
    pub fn matches(&self, branch: Option<&str>) -> bool {
        match self.branch.as_deref() {
            None => true,
            Some(label) => branch == Some(label),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn edge(source: &str, target: &str, branch: Option<&str>) -> EdgeDefinition {
        EdgeDefinition {
            source: source.to_string(),
            target: target.to_string(),
            branch: branch.map(String::from),
        }
    }

    #[test]
    fn unconditional_edge_matches_any_branch() {
        let e = edge("a", "b", None);
        assert!(e.matches(None));
        assert!(e.matches(Some("yes")));
    }

    #[test]
    fn labelled_edge_matches_only_equal_branch() {
        let e = edge("a", "b", Some("yes"));
        assert!(e.matches(Some("yes")));
        assert!(!e.matches(Some("no")));
        assert!(!e.matches(None));
    }

    #[test]
    fn node_type_serializes_as_type() {
        let node: NodeDefinition = serde_json::from_value(json!({
            "id": "check",
            "type": "condition",
            "config": {"expression": "true"}
        }))
        .unwrap();
        assert_eq!(node.node_type, "condition");

        let back = serde_json::to_value(&node).unwrap();
        assert_eq!(back["type"], "condition");
    }

    #[test]
    fn missing_config_defaults_to_empty_object() {
        let node: NodeDefinition =
            serde_json::from_value(json!({"id": "done", "type": "end"})).unwrap();
        assert_eq!(node.config, json!({}));
    }

    #[test]
    fn outgoing_preserves_declaration_order() {
        let flow = FlowDefinition {
            id: Uuid::now_v7(),
            workspace_id: Uuid::now_v7(),
            name: "fan".to_string(),
            agent_persona: None,
            nodes: vec![],
            edges: vec![edge("a", "c", None), edge("x", "y", None), edge("a", "b", None)],
            created_at: Utc::now(),
        };
        let targets: Vec<_> = flow.outgoing("a").map(|e| e.target.as_str()).collect();
        assert_eq!(targets, vec!["c", "b"]);
    }
}
