//! `stepwise executions`: one row per execution, read from its latest checkpoint.

use clap::ValueEnum;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use stepwise_types::workflow::ExecutionStatus;

use super::format_status;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusFilter {
    Pending,
    Running,
    Completed,
    Failed,
}

impl From<StatusFilter> for ExecutionStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Pending => ExecutionStatus::Pending,
            StatusFilter::Running => ExecutionStatus::Running,
            StatusFilter::Completed => ExecutionStatus::Completed,
            StatusFilter::Failed => ExecutionStatus::Failed,
        }
    }
}

pub async fn list_executions(
    state: &AppState,
    status: Option<StatusFilter>,
    json: bool,
) -> anyhow::Result<()> {
    let executions = state.engine.list_executions(status.map(Into::into)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&executions)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!();
        println!("  No executions found.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Execution").fg(Color::Cyan),
            Cell::new("Workflow").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Version").fg(Color::Cyan),
            Cell::new("Updated").fg(Color::Cyan),
        ]);

    for execution in &executions {
        table.add_row(vec![
            Cell::new(&execution.execution_id),
            Cell::new(&execution.workflow_id),
            format_status(execution.status),
            Cell::new(execution.current_step.as_deref().unwrap_or("-")),
            Cell::new(execution.latest_version),
            Cell::new(execution.updated_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!(
        "  {}",
        style(format!("{} execution(s)", executions.len())).dim()
    );
    println!();
    Ok(())
}
