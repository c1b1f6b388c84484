//! CLI command implementations

pub mod ask;
pub mod check;
pub mod hints;
pub mod info;

use anyhow::Context;
use colored::Colorize;
use satya_inference::{FallbackOutcome, OrchestratorConfig, TieredOrchestrator};

use crate::cli::{Cli, QuestionArgs};

/// Build the orchestrator from `--config`, or the stock layout under
/// `--models-dir`. Nothing is loaded yet.
pub fn build_orchestrator(cli: &Cli) -> anyhow::Result<TieredOrchestrator> {
    let config = match &cli.config {
        Some(path) => OrchestratorConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => OrchestratorConfig::default_layout(&cli.models_dir),
    };
    TieredOrchestrator::from_config(config).context("building orchestrator")
}

/// Context passage from `--context` or `--context-file`.
pub fn read_context(input: &QuestionArgs) -> anyhow::Result<String> {
    match &input.context_file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading context from {}", path.display())),
        None => Ok(input.context.clone()),
    }
}

pub fn print_outcome(outcome: &FallbackOutcome) {
    let served_by = if outcome.is_default() {
        outcome.answered_by.to_string().red()
    } else if outcome.fallback_triggered {
        outcome.answered_by.to_string().yellow()
    } else {
        outcome.answered_by.to_string().green()
    };
    println!();
    println!("  Served by: {served_by}    {} ms", outcome.latency_ms);
    for reason in &outcome.reasons {
        println!("  {} {}", "↳".dimmed(), reason.to_string().dimmed());
    }
}

pub fn confidence_label(confidence: f64) -> colored::ColoredString {
    let label = format!("{confidence:.2}");
    if confidence >= 0.7 {
        label.green()
    } else if confidence >= 0.4 {
        label.yellow()
    } else {
        label.red()
    }
}
