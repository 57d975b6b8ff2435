//! Stepwise operator CLI entry point.
//!
//! Binary name: `stepwise`
//!
//! Loads configuration, wires the runtime and dispatches to an inspection
//! command.

mod cli;
mod state;

use anyhow::Context;
use clap::Parser;

use cli::{Cli, Commands};
use state::AppState;
use stepwise_infra::config::{load_config, resolve_data_dir};
use stepwise_observe::tracing_setup::{init_tracing, shutdown_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli::log_filter(cli.verbose, cli.quiet), cli.otel) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let data_dir = resolve_data_dir();
    tracing::debug!(data_dir = %data_dir.display(), "resolved data directory");
    let config = load_config(&data_dir, cli.config.as_deref())
        .await
        .context("failed to load configuration")?;

    // Validation never touches the database.
    if let Commands::Validate = cli.command {
        return cli::validate::validate(&config, &data_dir, cli.json);
    }

    let state = AppState::init(&config, data_dir).await?;

    match cli.command {
        Commands::Validate => Ok(()),
        Commands::Executions { status } => {
            cli::executions::list_executions(&state, status, cli.json).await
        }
        Commands::History { execution_id } => {
            cli::history::show_history(&state, &execution_id, cli.json).await
        }
        Commands::Events { execution_id } => {
            cli::events::show_events(&state, &execution_id, cli.json).await
        }
        Commands::Health => cli::health::health(&state, cli.json).await,
    }
}
