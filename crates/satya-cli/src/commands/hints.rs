//! `satya hints` command implementation

use colored::Colorize;
use satya_inference::{InferenceRequest, TieredOrchestrator};

use super::{confidence_label, print_outcome, read_context};
use crate::cli::QuestionArgs;

/// Execute the `satya hints` command
pub async fn run(
    orchestrator: &TieredOrchestrator,
    input: &QuestionArgs,
    json: bool,
) -> anyhow::Result<()> {
    let context = read_context(input)?;
    let hints = orchestrator
        .hints(&InferenceRequest::hints(&input.question, context))
        .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&hints)?);
        return Ok(());
    }

    println!();
    println!("  {}", "Hints".bold());
    for (i, hint) in hints.items.iter().enumerate() {
        println!("  {}. {hint}", i + 1);
    }
    println!();
    println!("  Confidence: {}", confidence_label(hints.confidence));
    print_outcome(&hints.outcome);
    Ok(())
}
