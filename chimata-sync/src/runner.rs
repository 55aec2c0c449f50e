//! Script runner.
//!
//! Each invocation materialises the script body into a temporary `#!/bin/sh`
//! file, runs it through `sh` inside the mirror's working directory with
//! `PUBLIC_PATH` exported, and races the child against the job's
//! cancellation token and optional timeout.
//!
//! The temporary file is removed on every exit path: explicitly after the
//! child finishes, or by `TempPath`'s drop if the future is abandoned.
//!
//! Each script leads its own process group. Cancellation and timeout signal
//! the whole group, so anything the script forked (an `rsync`, a backgrounded
//! download) dies with it.

use std::io::Write;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tempfile::TempPath;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use chimata_core::MirrorName;

use crate::error::ScriptError;

/// Environment variable carrying the mirror's working directory.
pub const PUBLIC_PATH_ENV: &str = "PUBLIC_PATH";

/// How long a killed child gets to be reaped before we stop waiting.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Ternary result of one script invocation.
#[derive(Debug)]
pub enum ScriptOutcome {
    Success,
    Failure(ScriptError),
    Canceled,
}

impl ScriptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ScriptOutcome::Success)
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, ScriptOutcome::Canceled)
    }
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    Canceled,
    TimedOut,
}

/// Run `script` in `work_dir`. An empty (or whitespace-only) script succeeds
/// without spawning anything.
///
/// The script inherits the daemon's environment with `PUBLIC_PATH` added on
/// top; it is not run with an emptied environment, so `PATH` and `HOME` stay
/// usable from mirror scripts.
pub async fn run_script(
    script: &str,
    work_dir: &Path,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> ScriptOutcome {
    if script.trim().is_empty() {
        return ScriptOutcome::Success;
    }
    if cancel.is_cancelled() {
        return ScriptOutcome::Canceled;
    }

    let script_path = match write_temp_script(script) {
        Ok(path) => path,
        Err(err) => return ScriptOutcome::Failure(err),
    };

    let outcome = execute(&script_path, work_dir, cancel, timeout).await;

    let location = script_path.to_path_buf();
    match (script_path.close(), outcome) {
        (Ok(()), outcome) => outcome,
        (Err(source), ScriptOutcome::Success) => ScriptOutcome::Failure(ScriptError::Cleanup {
            path: location,
            source,
        }),
        (Err(source), outcome) => {
            tracing::warn!(
                "failed to remove temporary script {}: {}",
                location.display(),
                source
            );
            outcome
        }
    }
}

/// Run a success/failure hook. Failures are logged, never returned.
pub async fn run_hook(
    kind: &str,
    mirror: &MirrorName,
    script: &str,
    work_dir: &Path,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) {
    if script.trim().is_empty() {
        return;
    }
    match run_script(script, work_dir, cancel, timeout).await {
        ScriptOutcome::Success => tracing::debug!("{kind} hook for {mirror} finished"),
        ScriptOutcome::Failure(err) => {
            tracing::warn!("{kind} hook for {mirror} failed: {err}")
        }
        ScriptOutcome::Canceled => tracing::info!("{kind} hook for {mirror} canceled"),
    }
}

fn write_temp_script(script: &str) -> Result<TempPath, ScriptError> {
    let mut file = tempfile::Builder::new()
        .prefix("chimata-")
        .suffix(".sh")
        .tempfile()
        .map_err(ScriptError::TempFile)?;

    let write = |file: &mut tempfile::NamedTempFile| -> std::io::Result<()> {
        writeln!(file, "#!/bin/sh")?;
        writeln!(file, "{script}")?;
        file.flush()
    };
    if let Err(source) = write(&mut file) {
        return Err(ScriptError::Write {
            path: file.path().to_path_buf(),
            source,
        });
    }

    // Closes the write handle; the path stays owned until `close()`/drop.
    Ok(file.into_temp_path())
}

async fn execute(
    script_path: &Path,
    work_dir: &Path,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> ScriptOutcome {
    let mut command = Command::new("sh");
    command
        .arg(script_path)
        .current_dir(work_dir)
        .env(PUBLIC_PATH_ENV, work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(source) => {
            return ScriptOutcome::Failure(ScriptError::Spawn {
                path: script_path.to_path_buf(),
                source,
            })
        }
    };

    let deadline = async {
        match timeout {
            Some(after) => tokio::time::sleep(after).await,
            None => std::future::pending::<()>().await,
        }
    };

    let wake = tokio::select! {
        biased;
        _ = cancel.cancelled() => Wake::Canceled,
        status = child.wait() => Wake::Exited(status),
        _ = deadline => Wake::TimedOut,
    };

    match wake {
        Wake::Exited(Ok(status)) if status.success() => ScriptOutcome::Success,
        Wake::Exited(Ok(status)) => ScriptOutcome::Failure(ScriptError::Exit { status }),
        Wake::Exited(Err(err)) => ScriptOutcome::Failure(ScriptError::Wait(err)),
        Wake::Canceled => {
            terminate(&mut child).await;
            ScriptOutcome::Canceled
        }
        Wake::TimedOut => {
            terminate(&mut child).await;
            ScriptOutcome::Failure(ScriptError::TimedOut {
                // `deadline` only resolves when a timeout is set.
                after: timeout.unwrap_or_default(),
            })
        }
    }
}

/// SIGKILL the script's process group, then reap the `sh` leader.
async fn terminate(child: &mut Child) {
    match child.id() {
        Some(pid) => {
            if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                tracing::debug!("killpg({pid}) failed: {err}");
                let _ = child.start_kill();
            }
        }
        // Already reaped; only stragglers in the group could remain and the
        // group id is no longer known.
        None => {
            if let Err(err) = child.start_kill() {
                tracing::debug!("kill failed (child likely already exited): {err}");
            }
        }
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        tracing::warn!(
            "script process {:?} did not exit within {}s of kill",
            child.id(),
            KILL_GRACE.as_secs()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    #[tokio::test]
    async fn empty_script_succeeds_without_spawning() {
        let cancel = CancellationToken::new();
        let missing = Path::new("/definitely/not/a/dir");
        let outcome = run_script("  \n", missing, &cancel, None).await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure_with_status() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        match run_script("exit 3", dir.path(), &cancel, None).await {
            ScriptOutcome::Failure(ScriptError::Exit { status }) => {
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("expected exit failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn script_sees_public_path_and_cwd() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let outcome = run_script(
            "echo \"$PUBLIC_PATH\" > env.txt\npwd -P > cwd.txt",
            dir.path(),
            &cancel,
            None,
        )
        .await;
        assert!(outcome.is_success(), "got {outcome:?}");

        let env = std::fs::read_to_string(dir.path().join("env.txt")).unwrap();
        assert_eq!(env.trim(), dir.path().display().to_string());
        let cwd = std::fs::read_to_string(dir.path().join("cwd.txt")).unwrap();
        let expected = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(cwd.trim(), expected.display().to_string());
    }

    #[tokio::test]
    async fn temp_script_removed_after_run() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let outcome = run_script("echo \"$0\" > script_path.txt\nexit 1", dir.path(), &cancel, None).await;
        assert!(matches!(outcome, ScriptOutcome::Failure(_)));

        let script = std::fs::read_to_string(dir.path().join("script_path.txt")).unwrap();
        assert!(!Path::new(script.trim()).exists(), "temp script should be deleted");
    }

    #[tokio::test]
    async fn pre_canceled_token_never_spawns() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = run_script("touch spawned", dir.path(), &cancel, None).await;
        assert!(outcome.is_canceled());
        assert!(!dir.path().join("spawned").exists());
    }

    #[tokio::test]
    async fn cancel_kills_running_script() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = run_script("sleep 30", dir.path(), &cancel, None).await;
        assert!(outcome.is_canceled(), "got {outcome:?}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancel_kills_forked_workers() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let outcome = run_script(
            "sh -c 'sleep 2; touch still_ran' &\nwait",
            dir.path(),
            &cancel,
            None,
        )
        .await;
        assert!(outcome.is_canceled(), "got {outcome:?}");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(
            !dir.path().join("still_ran").exists(),
            "forked worker outlived cancellation"
        );
    }

    #[tokio::test]
    async fn timeout_kills_forked_workers() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let outcome = run_script(
            "sh -c 'sleep 2; touch still_ran' &\nwait",
            dir.path(),
            &cancel,
            Some(Duration::from_millis(300)),
        )
        .await;
        assert!(
            matches!(outcome, ScriptOutcome::Failure(ScriptError::TimedOut { .. })),
            "got {outcome:?}"
        );

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!dir.path().join("still_ran").exists());
    }

    #[tokio::test]
    async fn script_inherits_daemon_environment() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let outcome = run_script("test -n \"$PATH\" || exit 7", dir.path(), &cancel, None).await;
        assert!(outcome.is_success(), "got {outcome:?}");
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let outcome = run_script("sleep 30", dir.path(), &cancel, Some(Duration::from_secs(1))).await;
        assert!(
            matches!(outcome, ScriptOutcome::Failure(ScriptError::TimedOut { .. })),
            "got {outcome:?}"
        );
    }
}
