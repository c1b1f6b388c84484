//! `satya ask` command implementation

use colored::Colorize;
use satya_inference::{AnswerLength, InferenceRequest, TieredOrchestrator};

use super::{confidence_label, print_outcome, read_context};
use crate::cli::QuestionArgs;

/// Execute the `satya ask` command
pub async fn run(
    orchestrator: &TieredOrchestrator,
    input: &QuestionArgs,
    length: AnswerLength,
    json: bool,
) -> anyhow::Result<()> {
    let context = read_context(input)?;
    let request = InferenceRequest::answer(&input.question, context).with_answer_length(length);
    let answer = orchestrator.answer(&request).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
        return Ok(());
    }

    println!();
    println!("  {}", "Answer".bold());
    println!("  {}", answer.text);
    println!();
    println!("  Confidence: {}", confidence_label(answer.confidence));
    print_outcome(&answer.outcome);
    Ok(())
}
