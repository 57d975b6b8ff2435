//! `stepwise history <execution-id>`: the checkpoint audit trail.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use super::format_status;
use crate::state::AppState;

pub async fn show_history(state: &AppState, execution_id: &str, json: bool) -> anyhow::Result<()> {
    let history = state.engine.get_workflow_history(execution_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Version").fg(Color::Cyan),
            Cell::new("Transition").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Next step").fg(Color::Cyan),
            Cell::new("Completed").fg(Color::Cyan),
            Cell::new("Created").fg(Color::Cyan),
        ]);

    for checkpoint in &history {
        table.add_row(vec![
            Cell::new(format!("v{}", checkpoint.version)),
            Cell::new(checkpoint.transition.label()),
            format_status(checkpoint.status),
            Cell::new(checkpoint.current_step.as_deref().unwrap_or("-")),
            Cell::new(checkpoint.completed_steps.join(", ")),
            Cell::new(checkpoint.created_at.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
        ]);
    }

    println!();
    println!(
        "  {} {}",
        style("Execution").bold(),
        style(execution_id).cyan()
    );
    println!("{table}");
    println!();
    Ok(())
}
