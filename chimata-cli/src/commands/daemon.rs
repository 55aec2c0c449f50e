//! `chimata start|stop|reload` — daemon lifecycle.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;

use chimata_daemon::{start_blocking, DaemonError};

use super::client;

pub fn start(config: Option<&Path>) -> Result<()> {
    start_blocking(config).context("daemon exited with error")
}

pub fn stop(config: Option<&Path>) -> Result<()> {
    match client(config)?.stop() {
        Ok(()) => println!("daemon stop requested"),
        Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
        Err(err) => return Err(err).context("failed to stop daemon"),
    }
    Ok(())
}

pub fn reload(config: Option<&Path>) -> Result<()> {
    let summary = client(config)?.reload().context("reload failed")?;

    if summary.is_noop() {
        println!("configuration reloaded, nothing changed");
        return Ok(());
    }
    println!("configuration reloaded");
    print_names("added", &summary.added, |s| s.green().to_string());
    print_names("updated", &summary.updated, |s| s.yellow().to_string());
    print_names("removed", &summary.removed, |s| s.red().to_string());
    print_names("not scheduled", &summary.unscheduled, |s| s.red().bold().to_string());
    Ok(())
}

fn print_names<T: std::fmt::Display>(label: &str, names: &[T], paint: impl Fn(&str) -> String) {
    if names.is_empty() {
        return;
    }
    let joined = names
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    println!("  {} {}", paint(&format!("{label}:")), joined);
}
