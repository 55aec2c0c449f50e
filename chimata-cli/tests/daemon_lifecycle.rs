use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use tempfile::TempDir;

const CONFIG: &str = r#"
[base]
public_path = "public"
record_path = "records"
mirror_config_path = "mirrors.d"
log_path = "logs"

[[mirrors]]
name = "alpha"
exec = "exit 0"
period = "@every 1s"
"#;

fn chimata_bin() -> PathBuf {
    assert_cmd::cargo::cargo_bin!("chimata").to_path_buf()
}

struct DaemonProcess {
    child: Child,
    config: PathBuf,
}

impl DaemonProcess {
    fn start(config: PathBuf) -> Self {
        let child = Command::new(chimata_bin())
            .arg("--config")
            .arg(&config)
            .arg("start")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn daemon");
        Self { child, config }
    }

    fn stop(&mut self) {
        let _ = run_cli(&self.config, &["stop"]);

        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            sleep(Duration::from_millis(50));
        }

        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_cli(config: &Path, args: &[&str]) -> Output {
    Command::new(chimata_bin())
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("run chimata")
}

fn daemon_status(config: &Path) -> Option<serde_json::Value> {
    let output = run_cli(config, &["status", "--json"]);
    if !output.status.success() {
        return None;
    }
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
    (value["source"] == "daemon").then_some(value)
}

fn mirror_entry(status: &serde_json::Value, name: &str) -> Option<serde_json::Value> {
    status["mirrors"]
        .as_array()?
        .iter()
        .find(|m| m["name"] == name)
        .cloned()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(100));
    }
    false
}

#[test]
fn daemon_syncs_reloads_on_file_change_and_stops() {
    let root = TempDir::new().expect("root");
    fs::create_dir_all(root.path().join("mirrors.d")).expect("mirror dir");
    let config = root.path().join("config.toml");
    fs::write(&config, CONFIG).expect("write config");

    let mut daemon = DaemonProcess::start(config.clone());
    assert!(
        wait_until(Duration::from_secs(5), || daemon_status(&config).is_some()),
        "daemon did not answer status in time",
    );

    let record = root.path().join("records/alpha.json");
    let succeeded = wait_until(Duration::from_secs(10), || {
        fs::read_to_string(&record)
            .map(|raw| raw.contains("\"succeeded\""))
            .unwrap_or(false)
    });
    assert!(succeeded, "alpha should be recorded as succeeded");

    fs::write(
        root.path().join("mirrors.d/beta.toml"),
        "[[mirrors]]\nname = \"beta\"\nexec = \"exit 1\"\nperiod = \"@every 1h\"\n",
    )
    .expect("write beta");
    let picked_up = wait_until(Duration::from_secs(10), || {
        daemon_status(&config)
            .and_then(|status| mirror_entry(&status, "beta"))
            .map(|beta| beta["scheduled"] == true)
            .unwrap_or(false)
    });
    assert!(picked_up, "watcher should reload and schedule beta");

    let output = run_cli(&config, &["sync", "beta"]);
    assert!(
        output.status.success(),
        "sync failed: {}",
        String::from_utf8_lossy(&output.stderr),
    );
    let failed = wait_until(Duration::from_secs(10), || {
        fs::read_to_string(root.path().join("records/beta.json"))
            .map(|raw| raw.contains("\"failed\""))
            .unwrap_or(false)
    });
    assert!(failed, "beta should be recorded as failed");

    fs::remove_file(root.path().join("mirrors.d/beta.toml")).expect("remove beta");
    let dropped = wait_until(Duration::from_secs(10), || {
        daemon_status(&config)
            .map(|status| mirror_entry(&status, "beta").is_none())
            .unwrap_or(false)
    });
    assert!(dropped, "removing the mirror file should drop beta");

    daemon.stop();
    assert!(!root.path().join("records/chimata.sock").exists());
    let log = fs::read_to_string(root.path().join("logs/chimata.log")).expect("daemon log");
    assert!(log.lines().any(|line| line.contains("configuration reconciled")));
}
