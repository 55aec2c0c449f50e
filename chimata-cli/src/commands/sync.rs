//! `chimata sync` — run one mirror now through the daemon.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use super::client;

/// Arguments for `chimata sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Name of the mirror to sync.
    pub mirror: String,
}

impl SyncArgs {
    pub fn run(self, config: Option<&Path>) -> Result<()> {
        let started = client(config)?
            .sync(&self.mirror)
            .with_context(|| format!("sync failed for '{}'", self.mirror))?;

        if started {
            println!("{} sync of {} started", "✓".green(), self.mirror.bold());
        } else {
            println!(
                "{} {} is already syncing, request skipped",
                "•".yellow(),
                self.mirror.bold()
            );
        }
        Ok(())
    }
}
