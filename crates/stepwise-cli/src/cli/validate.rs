//! `stepwise validate`: load the configuration and print what it defines.

use std::path::Path;

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use stepwise_infra::config::resolve_database_url;
use stepwise_types::config::RuntimeConfig;

/// Print the workflows and agents of an already-validated config.
pub fn validate(config: &RuntimeConfig, data_dir: &Path, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Configuration is valid ({} workflow(s), {} agent(s))",
        style("*").green().bold(),
        config.workflows.len(),
        config.agents.len()
    );
    println!(
        "  {} {}",
        style("Checkpoint store:").dim(),
        resolve_database_url(config, data_dir)
    );
    println!("  {} {:?}", style("Message bus:").dim(), config.bus.kind);
    println!();

    if config.workflows.is_empty() {
        println!("  No workflows defined.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Workflow").fg(Color::Cyan),
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Agent").fg(Color::Cyan),
        ]);

    for workflow in &config.workflows {
        for (i, step) in workflow.steps.iter().enumerate() {
            let name = if i == 0 { workflow.id.as_str() } else { "" };
            table.add_row(vec![
                Cell::new(name),
                Cell::new(format!("{}. {step}", i + 1)),
                Cell::new(workflow.agent_for(step).unwrap_or("-")),
            ]);
        }
    }

    println!("{table}");
    println!();
    Ok(())
}
