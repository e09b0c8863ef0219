//! Conveyor CLI entry point.
//!
//! Binary name: `cnvy`
//!
//! Parses CLI arguments, initializes tracing, then dispatches to the
//! daemon, workflow, or engine command handlers. Exit codes: 0 on success,
//! 1 on failure, 130 after SIGINT, 143 after SIGTERM.

mod cli;
mod commands;
mod invoker;

use clap::Parser;
use clap_complete::generate;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, DaemonCommand, EngineCommand, WorkflowCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions need no setup at all.
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "cnvy", &mut std::io::stdout());
        return Ok(());
    }

    if cli.otel {
        conveyor_observe::tracing_setup::init_tracing(true)
            .map_err(|e| anyhow::anyhow!("tracing init: {e}"))?;
    } else {
        let filter = match cli.verbose {
            0 if cli.quiet => "error",
            0 => "info",
            1 => "info,conveyor=debug",
            _ => "trace",
        };
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
            )
            .with_target(false)
            .init();
    }

    let exit_code = match cli.command {
        Commands::Daemon { command } => match command {
            DaemonCommand::Run { config, supervised } => {
                commands::daemon::run(&config, supervised).await?
            }
        },

        Commands::Workflow { command } => match command {
            WorkflowCommand::Run { file, workspace, agents_file } => {
                commands::workflow::run(file, workspace, agents_file).await?
            }
            WorkflowCommand::Validate { file } => commands::workflow::validate(file).await?,
        },

        Commands::Engine { command } => match command {
            EngineCommand::Serve { max_concurrency, max_rps, cost_budget, agents_file } => {
                commands::engine::serve(max_concurrency, max_rps, cost_budget, agents_file).await?
            }
        },

        Commands::Completions { .. } => unreachable!("handled above"),
    };

    conveyor_observe::tracing_setup::shutdown_tracing();
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
