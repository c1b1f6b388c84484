//! `satya check` command implementation

use colored::Colorize;
use satya_inference::TieredOrchestrator;
use serde_json::json;

use super::info::status_table;

/// Execute the `satya check` command
///
/// Loads every configured backend once and fails if any of them cannot be
/// brought up.
pub async fn run(orchestrator: &TieredOrchestrator, json: bool) -> anyhow::Result<()> {
    let lifecycle = orchestrator.lifecycle();
    let mut failures = Vec::new();

    for id in lifecycle.backend_ids() {
        match lifecycle.ensure_loaded(&id).await {
            Ok(handle) => {
                tracing::debug!(backend = %id, mode = %handle.mode, "backend loaded");
            }
            Err(err) => failures.push((id, err.to_string())),
        }
    }

    if json {
        let report = json!({
            "ok": failures.is_empty(),
            "backends": orchestrator.backend_status(),
            "failures": failures
                .iter()
                .map(|(id, err)| json!({ "backend": id, "error": err }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        println!("{}", status_table(&orchestrator.backend_status()));
        println!();
        if failures.is_empty() {
            println!("  {} all backends loaded", "✓".green());
        }
        for (id, err) in &failures {
            println!("  {} {}: {}", "✗".red(), id.bold(), err);
        }
    }

    if !failures.is_empty() {
        anyhow::bail!(
            "{} of {} backends failed to load",
            failures.len(),
            lifecycle.backend_ids().len()
        );
    }
    Ok(())
}
