//! Error types for chimata-sync.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Why a script invocation counted as a failure.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to create temporary script: {0}")]
    TempFile(#[source] std::io::Error),

    #[error("failed to write temporary script {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn shell for {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for script: {0}")]
    Wait(#[source] std::io::Error),

    #[error("script exited with {status}")]
    Exit { status: ExitStatus },

    #[error("script timed out after {}s", .after.as_secs())]
    TimedOut { after: Duration },

    #[error("failed to remove temporary script {path}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by a job's init phase or working-directory checks.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("working directory {path} exists and is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("init script failed: {0}")]
    Init(#[from] ScriptError),

    #[error("canceled")]
    Canceled,
}

/// Convenience constructor for [`JobError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> JobError {
    JobError::Io {
        path: path.into(),
        source,
    }
}
