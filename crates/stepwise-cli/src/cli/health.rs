//! `stepwise health`: connect the engine and check every subsystem.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use crate::state::AppState;

fn check_line(ok: bool, name: &str, detail: &str) {
    let mark = if ok {
        style("ok").green().bold()
    } else {
        style("FAIL").red().bold()
    };
    if detail.is_empty() {
        println!("  [{mark}] {name}");
    } else {
        println!("  [{mark}] {name} {}", style(detail).dim());
    }
}

/// Exits non-zero when any subsystem is unhealthy.
pub async fn health(state: &AppState, json: bool) -> anyhow::Result<()> {
    state.engine.initialize().await?;
    let report = state.engine.health_report().await;
    let circuits = state.engine.get_circuit_breaker_stats();
    state.engine.shutdown().await;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "report": report,
                "circuits": circuits,
            }))?
        );
    } else {
        println!();
        println!("  {} {}", style("Data dir:").dim(), state.data_dir.display());
        check_line(
            report.store_reachable,
            "checkpoint store",
            report.store_error.as_deref().unwrap_or(""),
        );
        check_line(
            report.bus.healthy,
            &format!("message bus ({})", state.engine.bus().name()),
            report.bus.error.as_deref().unwrap_or(""),
        );
        for (agent_id, healthy) in &report.agents {
            check_line(*healthy, &format!("agent {agent_id}"), "");
        }

        if !circuits.is_empty() {
            let mut table = Table::new();
            table
                .load_preset(presets::UTF8_FULL_CONDENSED)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    Cell::new("Agent").fg(Color::Cyan),
                    Cell::new("Circuit").fg(Color::Cyan),
                    Cell::new("Failures").fg(Color::Cyan),
                    Cell::new("Calls").fg(Color::Cyan),
                    Cell::new("Last error").fg(Color::Cyan),
                ]);
            for stats in &circuits {
                table.add_row(vec![
                    Cell::new(&stats.agent_id),
                    Cell::new(stats.mode.to_string()),
                    Cell::new(stats.consecutive_failures),
                    Cell::new(stats.total_calls),
                    Cell::new(stats.last_error.as_deref().unwrap_or("-")),
                ]);
            }
            println!();
            println!("{table}");
        }

        println!();
        if report.healthy {
            println!("  {} All systems healthy", style("*").green().bold());
        } else {
            println!("  {} Runtime is unhealthy", style("!").red().bold());
        }
        println!();
    }

    if !report.healthy {
        anyhow::bail!("health check failed");
    }
    Ok(())
}
