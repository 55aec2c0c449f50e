//! Chimata — scheduled mirror sync daemon and its control CLI.
//!
//! # Usage
//!
//! ```text
//! chimata [--config <path>] start
//! chimata [--config <path>] stop
//! chimata [--config <path>] reload
//! chimata [--config <path>] sync <mirror>
//! chimata [--config <path>] status [--json] [--offline]
//! chimata [--config <path>] check
//! ```
//!
//! Without `--config`, `./config.toml` then `/etc/chimata/config.toml` are
//! tried in order.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{check::CheckArgs, status::StatusArgs, sync::SyncArgs};

#[derive(Parser, Debug)]
#[command(
    name = "chimata",
    version,
    about = "Keep mirrors in sync by running scripts on a schedule",
    long_about = None,
)]
struct Cli {
    /// Path to the base configuration file.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon in the foreground.
    Start,

    /// Ask a running daemon to shut down.
    Stop,

    /// Ask a running daemon to re-read its configuration.
    Reload,

    /// Trigger an immediate sync of one mirror.
    Sync(SyncArgs),

    /// Show per-mirror sync status.
    Status(StatusArgs),

    /// Validate configuration and show upcoming sync times.
    Check(CheckArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();
    match cli.command {
        Commands::Start => commands::daemon::start(config),
        Commands::Stop => commands::daemon::stop(config),
        Commands::Reload => commands::daemon::reload(config),
        Commands::Sync(args) => args.run(config),
        Commands::Status(args) => args.run(config),
        Commands::Check(args) => args.run(config),
    }
}
