//! CLI flow management subcommands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use flowline_core::flow::definition::load_flow_file;
use flowline_core::flow::graph;
use flowline_core::repository::flow::FlowRepository;
use flowline_types::flow::FlowDefinition;

use crate::state::AppState;

/// Flow management subcommands.
#[derive(Subcommand)]
pub enum FlowCommand {
    /// Register a flow from a YAML or JSON file.
    Register {
        /// Path to the flow file (`.json` or YAML).
        file: PathBuf,
    },

    /// List registered flows.
    #[command(alias = "ls")]
    List {
        /// Only flows of this workspace.
        #[arg(long)]
        workspace: Option<Uuid>,
    },

    /// Show a flow's nodes and edges.
    Show {
        /// Flow UUID.
        id: Uuid,
    },
}

pub async fn handle_flow_command(action: FlowCommand, state: &AppState, json: bool) -> Result<()> {
    match action {
        FlowCommand::Register { file } => handle_register(&file, state, json).await,
        FlowCommand::List { workspace } => handle_list(workspace, state, json).await,
        FlowCommand::Show { id } => handle_show(id, state, json).await,
    }
}

// ---------------------------------------------------------------------------
// Register
// ---------------------------------------------------------------------------

async fn handle_register(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let flow = load_flow_file(file)
        .with_context(|| format!("Failed to load flow from {}", file.display()))?;

    state.engine.register_flow(&flow).await?;

    if json {
        let out = serde_json::json!({
            "id": flow.id.to_string(),
            "name": flow.name,
            "nodes": flow.nodes.len(),
            "edges": flow.edges.len(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Registered flow '{}'",
        style("*").green().bold(),
        style(&flow.name).cyan()
    );
    println!("  ID:    {}", flow.id);
    println!("  Nodes: {}  Edges: {}", flow.nodes.len(), flow.edges.len());

    let orphans = graph::unreachable_nodes(&flow);
    if !orphans.is_empty() {
        println!(
            "  {} Unreachable from entry: {}",
            style("!").yellow().bold(),
            orphans.join(", ")
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(workspace: Option<Uuid>, state: &AppState, json: bool) -> Result<()> {
    let flows = state
        .engine
        .repo()
        .list_flows(workspace.as_ref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list flows: {e}"))?;

    if json {
        let out: Vec<_> = flows
            .iter()
            .map(|f| {
                serde_json::json!({
                    "id": f.id.to_string(),
                    "workspace_id": f.workspace_id.to_string(),
                    "name": f.name,
                    "nodes": f.nodes.len(),
                    "created_at": f.created_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if flows.is_empty() {
        println!();
        println!("  No flows registered.");
        println!(
            "  Register one with: {}",
            style("flowline flow register <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("ID"),
            Cell::new("Nodes"),
            Cell::new("Entry"),
            Cell::new("Created"),
        ]);

    for f in &flows {
        let entry = graph::entry_node(f).map(|n| n.id.as_str()).unwrap_or("-");
        table.add_row(vec![
            Cell::new(&f.name),
            Cell::new(f.id),
            Cell::new(f.nodes.len()),
            Cell::new(entry),
            Cell::new(f.created_at.format("%Y-%m-%d %H:%M")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

async fn handle_show(id: Uuid, state: &AppState, json: bool) -> Result<()> {
    let flow = state
        .engine
        .repo()
        .get_flow(&id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get flow: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("Flow {id} not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&flow)?);
        return Ok(());
    }

    print_flow(&flow);
    Ok(())
}

fn print_flow(flow: &FlowDefinition) {
    println!();
    println!("  {} {}", style("Flow:").bold(), style(&flow.name).cyan());
    println!("  ID:        {}", flow.id);
    println!("  Workspace: {}", flow.workspace_id);
    if let Some(persona) = &flow.agent_persona {
        println!("  Persona:   {}", style(persona).dim());
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Next"),
        ]);

    for node in &flow.nodes {
        let next: Vec<String> = flow
            .outgoing(&node.id)
            .map(|e| match &e.branch {
                Some(branch) => format!("{} [{branch}]", e.target),
                None => e.target.clone(),
            })
            .collect();
        table.add_row(vec![
            Cell::new(&node.id),
            Cell::new(&node.node_type),
            Cell::new(if next.is_empty() { "-".to_string() } else { next.join(", ") }),
        ]);
    }

    println!("{table}");
    println!();
}
