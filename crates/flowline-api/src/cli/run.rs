//! CLI execution subcommands.
//!
//! Continuations issued by these commands go onto the in-process queue.
//! `--wait` drains it so the execution runs to completion inside the
//! command; without it, queued successors are picked up by the next
//! recovery sweep (`flowline run recover` or `flowline serve` startup).

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use flowline_core::flow::{AdvanceOutcome, AdvanceRequest, StartRequest};
use flowline_core::repository::flow::FlowRepository;
use flowline_types::execution::{
    Execution, ExecutionContext, ExecutionStatus, NodeExecution, NodeExecutionStatus,
};

use crate::state::AppState;

/// Execution subcommands.
#[derive(Subcommand)]
pub enum RunCommand {
    /// Start a flow against a target entity.
    Start {
        /// Flow UUID.
        #[arg(long)]
        flow: Uuid,

        /// Target entity UUID.
        #[arg(long)]
        entity: Uuid,

        /// Workspace UUID owning both.
        #[arg(long)]
        workspace: Uuid,

        /// Initial context as a JSON object.
        #[arg(long)]
        context: Option<String>,

        /// Drive the execution to completion before returning.
        #[arg(long)]
        wait: bool,
    },

    /// Run one advance cycle for (execution, node).
    Advance {
        /// Execution UUID.
        execution: Uuid,

        /// Node ID within the execution's flow.
        node: String,

        /// Mark the delivery as a retry.
        #[arg(long)]
        retry: bool,

        /// Keep driving scheduled successors until the queue is empty.
        #[arg(long)]
        wait: bool,
    },

    /// Show an execution and its node log.
    Show {
        /// Execution UUID.
        id: Uuid,
    },

    /// List recent executions of a flow.
    #[command(alias = "ls")]
    List {
        /// Flow UUID.
        #[arg(long)]
        flow: Uuid,

        /// Maximum number of executions to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Reschedule the pending nodes of every running execution and drive
    /// them to completion.
    Recover,
}

pub async fn handle_run_command(action: RunCommand, state: &AppState, json: bool) -> Result<()> {
    match action {
        RunCommand::Start {
            flow,
            entity,
            workspace,
            context,
            wait,
        } => handle_start(flow, entity, workspace, context.as_deref(), wait, state, json).await,
        RunCommand::Advance {
            execution,
            node,
            retry,
            wait,
        } => handle_advance(execution, node, retry, wait, state, json).await,
        RunCommand::Show { id } => handle_show(id, state, json).await,
        RunCommand::List { flow, limit } => handle_list(flow, limit, state, json).await,
        RunCommand::Recover => handle_recover(state, json).await,
    }
}

/// Parse `--context`: must be a JSON object.
fn parse_context(raw: Option<&str>) -> Result<ExecutionContext> {
    let Some(raw) = raw else {
        return Ok(ExecutionContext::new());
    };
    match serde_json::from_str::<serde_json::Value>(raw).context("Invalid JSON context")? {
        serde_json::Value::Object(map) => Ok(map),
        _ => anyhow::bail!("--context must be a JSON object"),
    }
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

async fn handle_start(
    flow_id: Uuid,
    entity_id: Uuid,
    workspace_id: Uuid,
    context: Option<&str>,
    wait: bool,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let context = parse_context(context)?;

    let execution = state
        .engine
        .start_execution(StartRequest {
            flow_id,
            target_entity_id: entity_id,
            workspace_id,
            context,
        })
        .await?;

    if !wait {
        if json {
            println!("{}", serde_json::to_string_pretty(&execution)?);
        } else {
            println!();
            println!(
                "  {} Started execution {}",
                style("*").green().bold(),
                style(execution.id).cyan()
            );
            println!(
                "  Entry node: {}",
                execution.current_node_id.as_deref().unwrap_or("-")
            );
            println!(
                "  Drive it with: {}",
                style(format!(
                    "flowline run advance {} {}",
                    execution.id,
                    execution.current_node_id.as_deref().unwrap_or("<node>")
                ))
                .dim()
            );
            println!();
        }
        return Ok(());
    }

    let outcomes = state.drain_inline().await;
    report_drive(execution.id, &outcomes, state, json).await
}

// ---------------------------------------------------------------------------
// Advance
// ---------------------------------------------------------------------------

async fn handle_advance(
    execution_id: Uuid,
    node_id: String,
    is_retry: bool,
    wait: bool,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let outcome = state
        .engine
        .advance(AdvanceRequest {
            execution_id,
            node_id,
            context: ExecutionContext::new(),
            is_retry,
        })
        .await?;

    if wait {
        let mut outcomes = vec![outcome];
        outcomes.extend(state.drain_inline().await);
        return report_drive(execution_id, &outcomes, state, json).await;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    println!();
    println!("  {}", describe_outcome(&outcome));
    let pending = state.pending_inline();
    if pending > 0 {
        println!(
            "  {} continuation(s) queued; pass {} to drive them now.",
            pending,
            style("--wait").dim()
        );
    }
    println!();
    Ok(())
}

fn describe_outcome(outcome: &AdvanceOutcome) -> String {
    match outcome {
        AdvanceOutcome::Advanced {
            node_id,
            success,
            resumed,
            scheduled,
            status,
        } => {
            let mark = if *success {
                style("ok").green()
            } else {
                style("failed").red()
            };
            let resumed = if *resumed { " (resumed from log)" } else { "" };
            let next = if scheduled.is_empty() {
                "-".to_string()
            } else {
                scheduled.join(", ")
            };
            format!(
                "{} {node_id}{resumed} -> {next}  [execution {}]",
                mark,
                status.as_str()
            )
        }
        AdvanceOutcome::Duplicate {
            node_id,
            rescheduled,
        } => {
            if rescheduled.is_empty() {
                format!("{} {node_id} already finished", style("skip").yellow())
            } else {
                format!(
                    "{} {node_id} already finished, re-issued {}",
                    style("skip").yellow(),
                    rescheduled.join(", ")
                )
            }
        }
        AdvanceOutcome::InFlight { node_id } => {
            format!("{} {node_id} is running elsewhere", style("busy").yellow())
        }
        AdvanceOutcome::ExecutionFinished { status } => {
            format!("{} execution already {}", style("skip").yellow(), status.as_str())
        }
    }
}

async fn report_drive(
    execution_id: Uuid,
    outcomes: &[AdvanceOutcome],
    state: &AppState,
    json: bool,
) -> Result<()> {
    let execution = state.engine.execution(execution_id).await?;

    if json {
        let out = serde_json::json!({
            "execution": execution,
            "outcomes": outcomes,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    for outcome in outcomes {
        println!("  {}", describe_outcome(outcome));
    }
    println!();
    print_execution_summary(&execution);
    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

async fn handle_show(id: Uuid, state: &AppState, json: bool) -> Result<()> {
    let execution = state.engine.execution(id).await?;
    let nodes = state.engine.node_executions(id).await?;

    if json {
        let out = serde_json::json!({ "execution": execution, "nodes": nodes });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    print_execution_summary(&execution);
    if !nodes.is_empty() {
        println!("{}", node_table(&nodes));
        println!();
    }
    Ok(())
}

fn status_cell(status: ExecutionStatus) -> Cell {
    let color = match status {
        ExecutionStatus::Running => Color::Yellow,
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed => Color::Red,
    };
    Cell::new(status.as_str()).fg(color)
}

fn print_execution_summary(execution: &Execution) {
    let status = match execution.status {
        ExecutionStatus::Running => style(execution.status.as_str()).yellow(),
        ExecutionStatus::Completed => style(execution.status.as_str()).green(),
        ExecutionStatus::Failed => style(execution.status.as_str()).red(),
    };
    println!("  {} {}", style("Execution:").bold(), style(execution.id).cyan());
    println!("  Flow:      {}", execution.flow_id);
    println!("  Entity:    {}", execution.target_entity_id);
    println!("  Status:    {status}");
    println!(
        "  Last node: {}",
        execution.last_node().unwrap_or("-")
    );
    if let Some(err) = &execution.error {
        println!("  Error:     {}", style(err).red());
    }
    println!();
}

fn node_table(nodes: &[NodeExecution]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Attempt"),
            Cell::new("Status"),
            Cell::new("Duration"),
            Cell::new("Error"),
        ]);

    for n in nodes {
        let status = match n.status {
            NodeExecutionStatus::Running => Cell::new("running").fg(Color::Yellow),
            NodeExecutionStatus::Completed => Cell::new("completed").fg(Color::Green),
            NodeExecutionStatus::Failed => Cell::new("failed").fg(Color::Red),
        };
        let duration = n
            .completed_at
            .map(|done| format!("{}ms", (done - n.started_at).num_milliseconds()))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&n.node_id),
            Cell::new(&n.node_type),
            Cell::new(n.attempt),
            status,
            Cell::new(duration),
            Cell::new(n.error_message.as_deref().unwrap_or("")),
        ]);
    }
    table
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(flow_id: Uuid, limit: u32, state: &AppState, json: bool) -> Result<()> {
    let executions = state
        .engine
        .repo()
        .list_executions(&flow_id, limit)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list executions: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&executions)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!();
        println!("  No executions for flow {flow_id}.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Execution").fg(Color::Cyan),
            Cell::new("Entity"),
            Cell::new("Status"),
            Cell::new("Last node"),
            Cell::new("Started"),
        ]);

    for e in &executions {
        table.add_row(vec![
            Cell::new(e.id),
            Cell::new(e.target_entity_id),
            status_cell(e.status),
            Cell::new(e.last_node().unwrap_or("-")),
            Cell::new(e.started_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Recover
// ---------------------------------------------------------------------------

async fn handle_recover(state: &AppState, json: bool) -> Result<()> {
    let report = state.engine.recover_all().await?;
    let outcomes = state.drain_inline().await;

    if json {
        let out = serde_json::json!({
            "executions_scanned": report.executions_scanned,
            "continuations_scheduled": report.continuations_scheduled,
            "advanced": outcomes.len(),
            "errors": report.errors,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Recovered {} running execution(s), {} continuation(s) rescheduled",
        style("*").green().bold(),
        report.executions_scanned,
        report.continuations_scheduled
    );
    for outcome in &outcomes {
        println!("  {}", describe_outcome(outcome));
    }
    for err in &report.errors {
        println!("  {} {}", style("!").red().bold(), err);
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_context_accepts_objects_only() {
        assert!(parse_context(None).unwrap().is_empty());
        let ctx = parse_context(Some(r#"{"campaign":"spring"}"#)).unwrap();
        assert_eq!(ctx["campaign"], json!("spring"));
        assert!(parse_context(Some("[1,2]")).is_err());
        assert!(parse_context(Some("{not json")).is_err());
    }

    #[test]
    fn test_describe_outcome_mentions_resumed_and_successors() {
        let text = describe_outcome(&AdvanceOutcome::Advanced {
            node_id: "A".to_string(),
            success: true,
            resumed: true,
            scheduled: vec!["B".to_string(), "C".to_string()],
            status: ExecutionStatus::Running,
        });
        assert!(text.contains("A (resumed from log) -> B, C"));
        assert!(text.contains("running"));

        let text = describe_outcome(&AdvanceOutcome::InFlight {
            node_id: "B".to_string(),
        });
        assert!(text.contains("B is running elsewhere"));
    }
}
