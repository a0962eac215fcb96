//! Flow definition parsing, validation, and file loading.
//!
//! Converts YAML/JSON documents into the `FlowDefinition` graph and checks
//! structural constraints (unique node IDs, edges that resolve, parseable
//! node configs) before a flow can be registered.

use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use flowline_types::execution::LAST_NODE_KEY;
use flowline_types::flow::{EdgeDefinition, FlowDefinition, NodeDefinition};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::graph;
use super::node::NodeKind;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating a flow.
#[derive(Debug, Error)]
pub enum FlowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// An edge references a node that does not exist.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// A node's config does not match its type.
    #[error("invalid config for node '{node_id}': {reason}")]
    InvalidNodeConfig { node_id: String, reason: String },

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Document format
// ---------------------------------------------------------------------------

/// On-disk shape of a flow. `id` and `created_at` are assigned on load when
/// absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub workspace_id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_persona: Option<String>,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

impl FlowDocument {
    pub fn into_definition(self) -> FlowDefinition {
        FlowDefinition {
            id: self.id.unwrap_or_else(Uuid::now_v7),
            workspace_id: self.workspace_id,
            name: self.name,
            agent_persona: self.agent_persona,
            nodes: self.nodes,
            edges: self.edges,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `FlowDefinition`.
pub fn parse_flow_yaml(yaml: &str) -> Result<FlowDefinition, FlowError> {
    let doc: FlowDocument =
        serde_yaml_ng::from_str(yaml).map_err(|e| FlowError::ParseError(e.to_string()))?;
    let flow = doc.into_definition();
    validate_flow(&flow)?;
    Ok(flow)
}

/// Parse a JSON string into a validated `FlowDefinition`.
pub fn parse_flow_json(json: &str) -> Result<FlowDefinition, FlowError> {
    let doc: FlowDocument =
        serde_json::from_str(json).map_err(|e| FlowError::ParseError(e.to_string()))?;
    let flow = doc.into_definition();
    validate_flow(&flow)?;
    Ok(flow)
}

/// Load a flow from disk. `.json` files are parsed as JSON, anything else
/// as YAML.
pub fn load_flow_file(path: &Path) -> Result<FlowDefinition, FlowError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_flow_json(&content),
        _ => parse_flow_yaml(&content),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `FlowDefinition`.
///
/// Checks:
/// - Name is non-empty
/// - At least one node exists
/// - Node IDs are non-empty, unique, and not the reserved `last_node` key
/// - Every edge source and target names an existing node
/// - Every node config parses for its type
///
/// Cycles are allowed: a node runs at most once per execution, so a cycle
/// back to a finished node simply ends that branch.
pub fn validate_flow(flow: &FlowDefinition) -> Result<(), FlowError> {
    if flow.name.trim().is_empty() {
        return Err(FlowError::ValidationError(
            "flow name must not be empty".to_string(),
        ));
    }

    if flow.nodes.is_empty() {
        return Err(FlowError::ValidationError(
            "flow must have at least one node".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for node in &flow.nodes {
        if node.id.is_empty() {
            return Err(FlowError::ValidationError(
                "node ID must not be empty".to_string(),
            ));
        }
        if node.id == LAST_NODE_KEY {
            return Err(FlowError::ValidationError(format!(
                "node ID '{LAST_NODE_KEY}' is reserved"
            )));
        }
        if !seen_ids.insert(node.id.as_str()) {
            return Err(FlowError::ValidationError(format!(
                "duplicate node ID: '{}'",
                node.id
            )));
        }
    }

    for edge in &flow.edges {
        for end in [&edge.source, &edge.target] {
            if !seen_ids.contains(end.as_str()) {
                return Err(FlowError::UnknownNode(format!(
                    "edge {} -> {} references unknown node '{}'",
                    edge.source, edge.target, end
                )));
            }
        }
    }

    for node in &flow.nodes {
        NodeKind::parse(node)?;
    }

    if graph::has_cycle(flow) {
        tracing::warn!(
            flow = %flow.name,
            "flow graph contains a cycle; revisited nodes end their branch"
        );
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
