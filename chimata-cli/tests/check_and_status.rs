use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use assert_cmd::prelude::*;
use chimata_core::{record, MirrorName, StatusRecord, SyncStatus};
use chrono::Local;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

const CONFIG: &str = r#"
[base]
public_path = "public"
record_path = "records"
mirror_config_path = "mirrors.d"

[[mirrors]]
name = "debian"
exec = "true"
period = "*/30 * * * *"

[[mirrors]]
name = "archlinux"
exec = "true"
period = "@every 10m"
"#;

fn chimata_cmd(config: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("chimata"));
    cmd.arg("--config").arg(config).env("NO_COLOR", "1");
    cmd
}

fn write_config(root: &TempDir, contents: &str) -> PathBuf {
    let path = root.path().join("config.toml");
    fs::write(&path, contents).expect("write config");
    path
}

#[test]
fn check_lists_mirrors_with_next_fire_time() {
    let root = TempDir::new().expect("root");
    let config = write_config(&root, CONFIG);

    chimata_cmd(&config)
        .arg("check")
        .assert()
        .success()
        .stdout(contains("mirrors: 2"))
        .stdout(contains("debian"))
        .stdout(contains("archlinux"))
        .stdout(contains("next:"));
}

#[test]
fn check_fails_on_invalid_period() {
    let root = TempDir::new().expect("root");
    let config = write_config(&root, CONFIG);
    fs::create_dir_all(root.path().join("mirrors.d")).expect("mirror dir");
    fs::write(
        root.path().join("mirrors.d/broken.toml"),
        "[[mirrors]]\nname = \"broken\"\nexec = \"true\"\nperiod = \"61 * * * *\"\n",
    )
    .expect("write mirror file");

    chimata_cmd(&config)
        .args(["check", "--quiet"])
        .assert()
        .failure()
        .stdout(contains("broken"))
        .stdout(contains("debian").not())
        .stderr(contains("invalid period"));
}

#[test]
fn missing_config_is_reported() {
    let root = TempDir::new().expect("root");
    chimata_cmd(&root.path().join("absent.toml"))
        .arg("check")
        .assert()
        .failure()
        .stderr(contains("failed to load configuration"));
}

#[test]
fn offline_status_reads_record_files() {
    let root = TempDir::new().expect("root");
    let config = write_config(&root, CONFIG);
    let records = root.path().join("records");
    for (name, status) in [("debian", SyncStatus::Succeeded), ("archlinux", SyncStatus::Failed)] {
        record::save_at(
            &records,
            &StatusRecord {
                name: MirrorName::from(name),
                sync_status: status,
                last_change_time: Local::now(),
                period: "@hourly".to_string(),
            },
        )
        .expect("save record");
    }

    let assert = chimata_cmd(&config)
        .args(["status", "--offline", "--json"])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8");
    let value: serde_json::Value = serde_json::from_str(&stdout).expect("status JSON");

    assert_eq!(value["source"], "records");
    let mirrors = value["mirrors"].as_array().expect("mirrors array");
    assert_eq!(mirrors.len(), 2);
    assert_eq!(mirrors[0]["name"], "archlinux");
    assert_eq!(mirrors[0]["status"], "failed");
    assert_eq!(mirrors[1]["name"], "debian");
    assert_eq!(mirrors[1]["status"], "succeeded");

    chimata_cmd(&config)
        .args(["status", "--offline"])
        .assert()
        .success()
        .stdout(contains("SUCCEEDED"))
        .stdout(contains("FAILED"));
}

#[test]
fn status_without_daemon_falls_back_to_records() {
    let root = TempDir::new().expect("root");
    let config = write_config(&root, CONFIG);

    chimata_cmd(&config)
        .arg("status")
        .assert()
        .success()
        .stderr(contains("daemon is not running"))
        .stdout(contains("No mirrors recorded."));
}

#[test]
fn stop_without_daemon_is_not_an_error() {
    let root = TempDir::new().expect("root");
    let config = write_config(&root, CONFIG);

    chimata_cmd(&config)
        .arg("stop")
        .assert()
        .success()
        .stdout(contains("daemon is not running"));
}
