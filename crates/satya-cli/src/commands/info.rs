//! `satya info` command implementation

use colored::Colorize;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL};
use satya_inference::{BackendStatus, Residency, TieredOrchestrator};

/// Execute the `satya info` command
pub fn run(orchestrator: &TieredOrchestrator, json: bool) -> anyhow::Result<()> {
    if json {
        let info = orchestrator.get_model_info();
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let lifecycle = orchestrator.lifecycle();
    println!();
    println!("  {}", "Backends".bold());
    println!(
        "  residency: {}    budget: {} MB    resident: {} MB",
        lifecycle.policy(),
        lifecycle.budget_mb(),
        lifecycle.resident_mb()
    );
    println!();
    println!("{}", status_table(&orchestrator.backend_status()));
    Ok(())
}

pub(crate) fn status_table(statuses: &[BackendStatus]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "ID", "Name", "Kind", "Tier", "Tasks", "Footprint", "State", "Mode",
        ]);

    for status in statuses {
        let tasks = status
            .tasks
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(vec![
            Cell::new(&status.id),
            Cell::new(&status.name),
            Cell::new(status.kind.to_string()),
            Cell::new(status.tier.to_string()),
            Cell::new(tasks),
            Cell::new(format!("{} MB", status.footprint_mb)),
            residency_cell(status),
            Cell::new(status.mode.map(|m| m.to_string()).unwrap_or_else(|| "-".into())),
        ]);
    }
    table
}

fn residency_cell(status: &BackendStatus) -> Cell {
    match status.residency {
        Residency::Resident => Cell::new("resident").fg(Color::Green),
        Residency::Loading => Cell::new("loading").fg(Color::Yellow),
        Residency::Unloaded => Cell::new("unloaded"),
        Residency::Unavailable => Cell::new("unavailable").fg(Color::Red),
    }
}
