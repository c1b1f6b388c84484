//! Satya CLI - offline answers and study hints from the command line

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so --json output stays parseable
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_command_async(cli))
}

async fn run_command_async(cli: Cli) -> anyhow::Result<()> {
    let orchestrator = commands::build_orchestrator(&cli)?;

    let result = match &cli.command {
        Commands::Ask { input, length } => {
            commands::ask::run(&orchestrator, input, *length, cli.json).await
        }
        Commands::Hints { input } => commands::hints::run(&orchestrator, input, cli.json).await,
        Commands::Info => commands::info::run(&orchestrator, cli.json),
        Commands::Check => commands::check::run(&orchestrator, cli.json).await,
    };

    orchestrator.shutdown().await;
    result
}
