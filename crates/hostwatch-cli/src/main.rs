//! hostwatch - supervise a server host plugin and restart it on file changes

mod cli;
mod error;

use std::io::IsTerminal;
use std::sync::Arc;

use clap::Parser;
use cli::{Cli, Commands, RunArgs};
use colored::Colorize;
use error::CliError;
use hostwatch_runtime::{
    BoundaryConfig, ConsolePrompt, ProcessBoundaryFactory, RunOptions, ServiceRunner,
    SupervisorError, SupervisorService,
};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the status lines
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();

    if let Some(Commands::Worker { connect }) = &cli.command {
        tracing::debug!("Worker connecting to {}", connect);
        hostwatch_runtime::worker::run(connect)?;
        return Ok(());
    }

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(cli.run));
    drop(rt);

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            if !already_reported(&e) {
                eprintln!("{} {}", "Error:".red().bold(), e);
            }
            std::process::exit(1);
        }
    }
}

async fn run(args: RunArgs) -> Result<(), CliError> {
    let options = args.apply(RunOptions::load(args.config.as_deref())?);

    let boundary = BoundaryConfig::current_exe()?.with_stop_timeout(options.stop_timeout());
    let factory = Arc::new(ProcessBoundaryFactory::new(boundary));

    let mut service = SupervisorService::new(options, factory);
    let runner = if !args.service && std::io::stdin().is_terminal() {
        let prompt = Arc::new(ConsolePrompt::new());
        service = service.with_prompt(prompt.clone());
        ServiceRunner::interactive(prompt)
    } else {
        ServiceRunner::background()
    };

    runner.run(&mut service, &[]).await?;
    Ok(())
}

/// Configuration and start failures have already been printed as status lines.
fn already_reported(error: &CliError) -> bool {
    matches!(
        error,
        CliError::Supervisor(SupervisorError::Config(_) | SupervisorError::StartFailed(_))
    )
}
