//! Command-line surface for the `cnvy` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cnvy", about = "Conveyor automation orchestrator", version)]
pub struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Bridge tracing spans to an OpenTelemetry stdout exporter
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Daemon lifecycle
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
    /// Workflow operations
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommand,
    },
    /// Engine (supervised worker host) operations
    Engine {
        #[command(subcommand)]
        command: EngineCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Run the daemon with the given config
    Run {
        /// Daemon config file (YAML)
        #[arg(long, short)]
        config: PathBuf,
        /// Dispatch worker tasks through a supervised engine process
        #[arg(long)]
        supervised: bool,
    },
}

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Execute a workflow file once and print the final state
    Run {
        /// Workflow definition (YAML)
        file: PathBuf,
        /// Workspace directory (defaults to the current directory)
        #[arg(long, short)]
        workspace: Option<PathBuf>,
        /// Worker catalog file (YAML)
        #[arg(long)]
        agents_file: Option<PathBuf>,
    },
    /// Parse and validate a workflow file without executing it
    Validate {
        /// Workflow definition (YAML)
        file: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum EngineCommand {
    /// Serve the engine protocol on stdio
    Serve {
        /// Maximum concurrent worker tasks
        #[arg(long, default_value_t = 8)]
        max_concurrency: usize,
        /// Requests-per-second cap (sliding 1s window)
        #[arg(long)]
        max_rps: Option<u32>,
        /// Total cost budget
        #[arg(long)]
        cost_budget: Option<f64>,
        /// Worker catalog file (YAML)
        #[arg(long)]
        agents_file: Option<PathBuf>,
    },
}
