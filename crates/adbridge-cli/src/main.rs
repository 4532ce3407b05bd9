//! AdBridge CLI - Command-line interface for the AdBridge daemon
//!
//! Provides commands for:
//! - Viewing sync and anomaly status
//! - Triggering delta/full/resume syncs
//! - Inspecting and clearing the operator event log
//! - Testing a forest configuration before saving it
//! - Resetting the sync database

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::anomaly::AnomalyCommand;
use commands::config::ConfigCommand;
use commands::events::EventsCommand;
use commands::status::StatusCommand;
use commands::sync::SyncCommand;
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(name = "adbridge", version, about = "Directory-to-cloud identity bridge")]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show synchronization and anomaly status
    Status(StatusCommand),
    /// Trigger a synchronization cycle
    Sync(SyncCommand),
    /// Inspect or clear the operator event log
    #[command(subcommand)]
    Events(EventsCommand),
    /// Inspect or clear the anomaly latch
    #[command(subcommand)]
    Anomaly(AnomalyCommand),
    /// Configuration management and connectivity tests
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };

    match cli.command {
        Commands::Status(cmd) => cmd.execute(format).await,
        Commands::Sync(cmd) => cmd.execute(format).await,
        Commands::Events(cmd) => cmd.execute(format).await,
        Commands::Anomaly(cmd) => cmd.execute(format).await,
        Commands::Config(cmd) => cmd.execute(format).await,
    }
}
