//! `chimata check` — validate configuration without starting the daemon.

use std::path::Path;

use anyhow::{bail, Result};
use chrono::Local;
use clap::Args;
use colored::Colorize;

use chimata_core::{Config, MirrorConfig, Schedule};

use super::load_config;

/// Arguments for `chimata check`.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Only print problems.
    #[arg(long, short)]
    pub quiet: bool,
}

impl CheckArgs {
    pub fn run(self, config: Option<&Path>) -> Result<()> {
        let (path, config) = load_config(config)?;

        if !self.quiet {
            print_base(&path, &config);
        }

        let mut invalid = 0usize;
        for mirror in &config.mirrors {
            match describe(mirror) {
                Ok(line) => {
                    if !self.quiet {
                        println!("{} {:<20} {}", "✓".green(), mirror.name.as_str(), line);
                    }
                }
                Err(reason) => {
                    invalid += 1;
                    println!("{} {:<20} {}", "✗".red(), mirror.name.as_str(), reason.red());
                }
            }
        }

        if config.mirrors.is_empty() && !self.quiet {
            println!("No mirrors configured.");
        }
        if invalid > 0 {
            bail!("{invalid} mirror(s) have an invalid period");
        }
        Ok(())
    }
}

fn print_base(path: &Path, config: &Config) {
    let base = &config.base;
    println!("{} {}", "config:".bold(), path.display());
    println!("  public_path        {}", base.public_path.display());
    println!("  record_path        {}", base.record_path.display());
    println!("  mirror_config_path {}", base.mirror_config_path.display());
    println!("  socket_path        {}", base.socket_path().display());
    match &base.log_path {
        Some(log_path) => println!("  log_path           {}", log_path.display()),
        None => println!("  log_path           (stderr)"),
    }
    println!("{} {}", "mirrors:".bold(), config.mirrors.len());
}

/// Period plus next fire time, or why the period is unusable.
fn describe(mirror: &MirrorConfig) -> Result<String, String> {
    let schedule = Schedule::parse(&mirror.period)
        .map_err(|err| format!("period '{}': {err}", mirror.period))?;
    match schedule.next_after(Local::now()) {
        Some(next) => Ok(format!(
            "{:<16} next: {}",
            mirror.period,
            next.format("%Y-%m-%d %H:%M:%S")
        )),
        None => Err(format!("period '{}' never fires", mirror.period)),
    }
}
