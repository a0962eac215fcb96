//! Flowline CLI and internal API entry point.
//!
//! Binary name: `flowline`
//!
//! Parses CLI arguments, initializes the database and engine, then
//! dispatches to the command handler or starts the trigger server.

mod cli;
mod http;
mod state;

use std::sync::Arc;

use clap::Parser;
use clap_complete::generate;
use tokio_util::sync::CancellationToken;

use flowline_core::flow::scheduler::RedeliveryPolicy;
use flowline_core::flow::worker::ContinuationWorker;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    flowline_observe::init_tracing(cli.log_filter(), cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    flowline_observe::shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        // Shell completions don't need app state
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(shell, &mut cmd, "flowline", &mut std::io::stdout());
            Ok(())
        }

        Commands::Serve { port, host } => serve(host, port).await,

        Commands::Flow { action } => {
            let state = AppState::init_inline().await?;
            cli::flow::handle_flow_command(action, &state, cli.json).await
        }

        Commands::Run { action } => {
            let state = AppState::init_inline().await?;
            cli::run::handle_run_command(action, &state, cli.json).await
        }

        Commands::Entity { action } => {
            let state = AppState::init_inline().await?;
            cli::entity::handle_entity_command(action, &state, cli.json).await
        }
    }
}

/// Run the continuation worker and the internal HTTP surface until Ctrl+C
/// or SIGTERM.
async fn serve(host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let (state, scheduler, receiver) = AppState::init_channel().await?;
    let shutdown = CancellationToken::new();

    let worker = ContinuationWorker::new(
        Arc::clone(&state.engine),
        scheduler,
        RedeliveryPolicy::from(state.config.as_ref()),
        shutdown.clone(),
    );
    let worker_handle = tokio::spawn(worker.run(receiver));

    let mut events = state.engine.event_bus().subscribe();
    let event_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = event_shutdown.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => tracing::debug!(execution_id = %event.execution_id(), ?event, "flow event"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "flow event log lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    let report = state.engine.recover_all().await?;
    if report.executions_scanned > 0 {
        tracing::info!(
            executions = report.executions_scanned,
            continuations = report.continuations_scheduled,
            errors = report.errors.len(),
            "startup recovery finished"
        );
    }

    let host = host.unwrap_or_else(|| state.config.server.host.clone());
    let port = port.unwrap_or(state.config.server.port);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!(
        "  {} Flowline listening on {}",
        console::style("*").green().bold(),
        console::style(format!("http://{addr}")).cyan()
    );
    println!("  Data dir: {}", state.data_dir.display());
    if state.internal_token_hash.is_none() {
        println!(
            "  {} {} is not set; internal routes will reject every request.",
            console::style("!").yellow().bold(),
            http::extractors::auth::INTERNAL_TOKEN_ENV
        );
    }
    println!("  {}", console::style("Press Ctrl+C to stop").dim());

    let router = http::router::build_router(state);
    let server_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = worker_handle.await {
        tracing::error!(error = %e, "continuation worker panicked");
    }

    println!("\n  Server stopped.");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
