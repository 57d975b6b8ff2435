//! `stepwise events <execution-id>`: lifecycle events recorded for an execution.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use crate::state::AppState;

pub async fn show_events(state: &AppState, execution_id: &str, json: bool) -> anyhow::Result<()> {
    let events = state.engine.get_workflow_events(execution_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    if events.is_empty() {
        println!();
        println!(
            "  No events recorded for {}.",
            style(execution_id).cyan()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Time").fg(Color::Cyan),
            Cell::new("Event").fg(Color::Cyan),
            Cell::new("Payload").fg(Color::Cyan),
        ]);

    for event in &events {
        table.add_row(vec![
            Cell::new(event.created_at.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
            Cell::new(event.event_type.as_str()),
            Cell::new(event.payload.to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}
