//! CLI command definitions for the `flowline` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are grouped by
//! noun (`flowline flow register`, `flowline run start`).

pub mod entity;
pub mod flow;
pub mod run;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Durable flow execution engine.
#[derive(Parser)]
#[command(name = "flowline", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "FLOWLINE_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Default log filter for the chosen verbosity. `RUST_LOG` overrides it.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "warn",
            1 => "info,flowline_core=debug",
            _ => "trace",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the internal trigger API and the continuation worker.
    Serve {
        /// Port to listen on (defaults to `[server] port` in config.toml).
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (defaults to `[server] host` in config.toml).
        #[arg(long)]
        host: Option<String>,
    },

    /// Manage flow definitions.
    Flow {
        #[command(subcommand)]
        action: flow::FlowCommand,
    },

    /// Start, drive and inspect executions.
    Run {
        #[command(subcommand)]
        action: run::RunCommand,
    },

    /// Manage target entities.
    Entity {
        #[command(subcommand)]
        action: entity::EntityCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_start_with_wait() {
        let cli = Cli::try_parse_from([
            "flowline",
            "--json",
            "run",
            "start",
            "--flow",
            "0190f5a0-0000-7000-8000-000000000001",
            "--entity",
            "0190f5a0-0000-7000-8000-000000000002",
            "--workspace",
            "0190f5a0-0000-7000-8000-000000000003",
            "--wait",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run {
                action: run::RunCommand::Start { wait, context, .. },
            } => {
                assert!(wait);
                assert!(context.is_none());
            }
            _ => panic!("expected run start"),
        }
    }

    #[test]
    fn test_verbosity_maps_to_filter() {
        let cli = Cli::try_parse_from(["flowline", "-v", "run", "recover"]).unwrap();
        assert_eq!(cli.log_filter(), "info,flowline_core=debug");
        let cli = Cli::try_parse_from(["flowline", "--quiet", "run", "recover"]).unwrap();
        assert_eq!(cli.log_filter(), "error");
    }
}
