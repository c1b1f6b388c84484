//! CLI command definitions using clap

use clap::{Args, Parser, Subcommand};
use satya_inference::AnswerLength;
use std::path::PathBuf;

/// Satya - offline answers and study hints
#[derive(Parser)]
#[command(name = "satya")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Configuration file path (toml, yaml or json)
    #[arg(short = 'c', long, global = true, env = "SATYA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Models directory for the stock layout (ignored with --config)
    #[arg(
        short = 'm',
        long,
        global = true,
        env = "SATYA_MODELS_DIR",
        default_value = "models"
    )]
    pub models_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

/// Question and retrieved passage
#[derive(Args, Debug, Clone)]
pub struct QuestionArgs {
    /// The student's question
    pub question: String,

    /// Context passage
    #[arg(long, default_value = "", conflicts_with = "context_file")]
    pub context: String,

    /// Read the context passage from a file
    #[arg(long)]
    pub context_file: Option<PathBuf>,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Answer a question from a context passage
    Ask {
        #[command(flatten)]
        input: QuestionArgs,

        /// Answer length for generative backends
        #[arg(short, long, default_value = "medium")]
        length: AnswerLength,
    },

    /// Produce three study hints for a question
    Hints {
        #[command(flatten)]
        input: QuestionArgs,
    },

    /// Show backend diagnostics
    Info,

    /// Load every configured backend and report what fails
    Check,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_ask() {
        let cli = Cli::parse_from([
            "satya",
            "ask",
            "What is osmosis?",
            "--context",
            "Osmosis is diffusion of water.",
            "-l",
            "short",
            "--json",
        ]);
        assert!(cli.json);
        match cli.command {
            Commands::Ask { input, length } => {
                assert_eq!(input.question, "What is osmosis?");
                assert_eq!(length, AnswerLength::Short);
            }
            _ => panic!("expected ask"),
        }
    }
}
