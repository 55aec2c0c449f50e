//! `chimata status` — per-mirror sync status.
//!
//! Asks the running daemon by default. `--offline`, or a daemon that is not
//! running, falls back to the record files under `record_path`.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use chimata_core::{record, StatusRecord, SyncStatus};
use chimata_daemon::{DaemonClient, DaemonError};

use super::load_config;

/// Arguments for `chimata status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,

    /// Read record files directly instead of asking the daemon.
    #[arg(long)]
    pub offline: bool,
}

#[derive(Debug, Clone, Serialize)]
struct MirrorStatus {
    name: String,
    status: SyncStatus,
    last_change_time: Option<DateTime<Local>>,
    period: String,
    scheduled: Option<bool>,
    running: Option<bool>,
    next_fire: Option<DateTime<Local>>,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    source: &'static str,
    mirrors: Vec<MirrorStatus>,
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "mirror")]
    name: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "last change")]
    last_change: String,
    #[tabled(rename = "period")]
    period: String,
    #[tabled(rename = "next sync")]
    next_fire: String,
}

impl StatusArgs {
    pub fn run(self, config: Option<&Path>) -> Result<()> {
        let (_, config) = load_config(config)?;

        let report = if self.offline {
            offline_report(&config.base.record_path)?
        } else {
            match DaemonClient::new(config.base.socket_path()).status() {
                Ok(payload) => daemon_report(&payload),
                Err(DaemonError::DaemonNotRunning { .. }) => {
                    eprintln!("daemon is not running; showing recorded status");
                    offline_report(&config.base.record_path)?
                }
                Err(err) => return Err(err).context("failed to query daemon status"),
            }
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize status JSON")?
            );
            return Ok(());
        }

        print_table(report);
        Ok(())
    }
}

fn offline_report(record_dir: &Path) -> Result<StatusReport> {
    let records = record::list_at(record_dir)
        .with_context(|| format!("failed to read records in {}", record_dir.display()))?;
    Ok(StatusReport {
        source: "records",
        mirrors: records.into_iter().map(from_record).collect(),
    })
}

fn from_record(record: StatusRecord) -> MirrorStatus {
    MirrorStatus {
        name: record.name.0,
        status: record.sync_status,
        last_change_time: Some(record.last_change_time),
        period: record.period,
        scheduled: None,
        running: None,
        next_fire: None,
    }
}

fn daemon_report(payload: &Value) -> StatusReport {
    let mirrors = payload["mirrors"]
        .as_array()
        .map(|mirrors| mirrors.iter().map(from_daemon_entry).collect())
        .unwrap_or_default();
    StatusReport {
        source: "daemon",
        mirrors,
    }
}

fn from_daemon_entry(entry: &Value) -> MirrorStatus {
    MirrorStatus {
        name: entry["name"].as_str().unwrap_or_default().to_string(),
        status: entry["status"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default(),
        last_change_time: parse_time(&entry["last_change_time"]),
        period: entry["period"].as_str().unwrap_or_default().to_string(),
        scheduled: entry["scheduled"].as_bool(),
        running: entry["running"].as_bool(),
        next_fire: parse_time(&entry["next_fire"]),
    }
}

fn parse_time(value: &Value) -> Option<DateTime<Local>> {
    let raw = value.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|at| at.with_timezone(&Local))
}

fn print_table(report: StatusReport) {
    println!(
        "Chimata v{} | {} mirrors | source: {}",
        env!("CARGO_PKG_VERSION"),
        report.mirrors.len(),
        report.source,
    );

    if report.mirrors.is_empty() {
        println!("No mirrors recorded.");
        return;
    }

    let rows: Vec<StatusTableRow> = report
        .mirrors
        .into_iter()
        .map(|mirror| StatusTableRow {
            status: status_label(&mirror),
            last_change: format_time(mirror.last_change_time),
            next_fire: match (mirror.scheduled, mirror.next_fire) {
                (Some(false), _) => "not scheduled".red().to_string(),
                (_, Some(at)) => format_time(Some(at)),
                (_, None) => "-".to_string(),
            },
            name: mirror.name,
            period: mirror.period,
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn status_label(mirror: &MirrorStatus) -> String {
    let label = match mirror.status {
        SyncStatus::NotPrepared => "NOT PREPARED".bright_black().bold(),
        SyncStatus::Syncing => "SYNCING".yellow().bold(),
        SyncStatus::Succeeded => "SUCCEEDED".green().bold(),
        SyncStatus::Failed => "FAILED".red().bold(),
    };
    label.to_string()
}

fn format_time(at: Option<DateTime<Local>>) -> String {
    at.map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}
