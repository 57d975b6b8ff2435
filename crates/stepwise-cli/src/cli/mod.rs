//! CLI command definitions and dispatch for the `stepwise` binary.
//!
//! The CLI is for operators inspecting a runtime's durable state. It never
//! starts, resumes or rolls back workflows.

pub mod events;
pub mod executions;
pub mod health;
pub mod history;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use comfy_table::{Cell, Color};
use stepwise_types::workflow::ExecutionStatus;

use executions::StatusFilter;

/// Inspect Stepwise workflow executions and runtime health.
#[derive(Parser)]
#[command(name = "stepwise", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (default: $STEPWISE_DATA_DIR/stepwise.toml).
    #[arg(long, global = true, env = "STEPWISE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Only log errors. Command output is still printed.
    #[arg(long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans with OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate the configuration, then list workflows.
    Validate,

    /// List executions from their latest checkpoint.
    #[command(alias = "ls")]
    Executions {
        /// Only show executions in this status.
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,
    },

    /// Show the checkpoint history of an execution.
    History {
        /// Execution ID.
        execution_id: String,
    },

    /// Show recorded lifecycle events of an execution.
    Events {
        /// Execution ID.
        execution_id: String,
    },

    /// Check the checkpoint store, message bus, agents and circuit breakers.
    Health,
}

/// Log filter for the verbosity flags.
pub fn log_filter(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "warn",
        1 => "info,stepwise=debug",
        _ => "trace",
    }
}

pub(crate) fn format_status(status: ExecutionStatus) -> Cell {
    match status {
        ExecutionStatus::Pending => Cell::new("pending").fg(Color::Yellow),
        ExecutionStatus::Running => Cell::new("running").fg(Color::Blue),
        ExecutionStatus::Completed => Cell::new("completed").fg(Color::Green),
        ExecutionStatus::Failed => Cell::new("failed").fg(Color::Red),
    }
}
