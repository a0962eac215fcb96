//! Graph queries over a flow: entry resolution, branch-filtered successors,
//! and the pending frontier that decides when an execution is finished.
//!
//! Uses `petgraph` for structural checks (cycles, reachability). Successor
//! selection works directly on the edge list so declaration order is kept.

use std::collections::{HashMap, HashSet};

use flowline_types::execution::{ExecutionContext, ExecutionStatus};
use flowline_types::flow::{FlowDefinition, NodeDefinition};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use serde_json::Value;

use super::node::NodeKind;

// ---------------------------------------------------------------------------
// petgraph view
// ---------------------------------------------------------------------------

struct FlowGraph<'a> {
    graph: DiGraph<&'a str, ()>,
    index: HashMap<&'a str, NodeIndex>,
}

impl<'a> FlowGraph<'a> {
    /// Build a graph view. Edges naming unknown nodes are ignored here;
    /// `validate_flow` reports them.
    fn build(flow: &'a FlowDefinition) -> Self {
        let mut graph = DiGraph::<&str, ()>::new();
        let index: HashMap<&str, NodeIndex> = flow
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), graph.add_node(n.id.as_str())))
            .collect();
        for edge in &flow.edges {
            if let (Some(&from), Some(&to)) =
                (index.get(edge.source.as_str()), index.get(edge.target.as_str()))
            {
                graph.add_edge(from, to, ());
            }
        }
        Self { graph, index }
    }

    fn in_degree(&self, id: &str) -> usize {
        self.index
            .get(id)
            .map(|&ix| {
                self.graph
                    .neighbors_directed(ix, Direction::Incoming)
                    .filter(|&src| src != ix)
                    .count()
            })
            .unwrap_or(0)
    }
}

/// Whether the flow graph contains a directed cycle.
pub fn has_cycle(flow: &FlowDefinition) -> bool {
    is_cyclic_directed(&FlowGraph::build(flow).graph)
}

/// The node an execution starts at: the first declared node without
/// incoming edges, or the first declared node when every node has one.
pub fn entry_node(flow: &FlowDefinition) -> Option<&NodeDefinition> {
    let view = FlowGraph::build(flow);
    flow.nodes
        .iter()
        .find(|n| view.in_degree(&n.id) == 0)
        .or_else(|| flow.nodes.first())
}

/// Node IDs that cannot be reached from the entry node.
pub fn unreachable_nodes(flow: &FlowDefinition) -> Vec<&str> {
    let Some(entry) = entry_node(flow) else {
        return Vec::new();
    };
    let view = FlowGraph::build(flow);
    let mut reached = HashSet::new();
    if let Some(&start) = view.index.get(entry.id.as_str()) {
        let mut dfs = Dfs::new(&view.graph, start);
        while let Some(ix) = dfs.next(&view.graph) {
            reached.insert(view.graph[ix]);
        }
    }
    flow.nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| !reached.contains(id))
        .collect()
}

// ---------------------------------------------------------------------------
// Successor selection
// ---------------------------------------------------------------------------

/// The `branch` selector carried by a node output, if any.
pub fn output_branch(output: &Value) -> Option<&str> {
    output.get("branch").and_then(|b| b.as_str())
}

/// Targets of the edges leaving `node_id` whose branch label is unset or
/// equals `branch`. Each target appears once, in edge declaration order.
pub fn matching_successors<'a>(
    flow: &'a FlowDefinition,
    node_id: &str,
    branch: Option<&str>,
) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    flow.outgoing(node_id)
        .filter(|e| e.matches(branch))
        .map(|e| e.target.as_str())
        .filter(|t| seen.insert(*t))
        .collect()
}

/// Successors to schedule after `node` finished with `output`. `end` nodes
/// terminate their branch regardless of outgoing edges.
pub fn next_nodes<'a>(
    flow: &'a FlowDefinition,
    node: &NodeDefinition,
    output: &Value,
) -> Vec<&'a str> {
    if NodeKind::is_end_type(&node.node_type) {
        return Vec::new();
    }
    matching_successors(flow, &node.id, output_branch(output))
}

/// Nodes that a finished node selected but that have not finished yet.
///
/// An execution with an empty frontier has no live branch left.
pub fn pending_frontier(flow: &FlowDefinition, context: &ExecutionContext) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut frontier = Vec::new();
    for node in &flow.nodes {
        let Some(output) = context.get(&node.id) else {
            continue;
        };
        for next in next_nodes(flow, node, output) {
            if !context.contains_key(next) && seen.insert(next) {
                frontier.push(next.to_string());
            }
        }
    }
    frontier
}

/// Status an execution should move to after a merge: `Completed` when it
/// is still running and no branch is pending, otherwise unchanged.
pub fn settled_status(
    flow: &FlowDefinition,
    status: ExecutionStatus,
    context: &ExecutionContext,
) -> ExecutionStatus {
    if status == ExecutionStatus::Running && pending_frontier(flow, context).is_empty() {
        ExecutionStatus::Completed
    } else {
        status
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
