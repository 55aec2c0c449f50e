//! Per-mirror sync job.
//!
//! ## Lifecycle
//!
//! 1. [`SyncJob::initialize`]: once, at creation: persist `NotPrepared`,
//!    ensure the working directory, run `init_exec`. An `Err` means the job
//!    must not be scheduled.
//! 2. [`SyncJob::run`]: once per tick: `Syncing` → exec → `Succeeded` or
//!    `Failed` → matching hook. Cancellation abandons the tick without a
//!    terminal status or hook.
//!
//! The job never guards against overlapping `run` calls itself; the
//! dispatcher's overlap policy does. Config swaps take effect on the next
//! `run` because each run works from a snapshot taken at its start.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Local};
use tokio_util::sync::CancellationToken;

use chimata_core::{record, BaseConfig, MirrorConfig, MirrorName, StatusRecord, SyncStatus};

use crate::error::{io_err, JobError};
use crate::runner::{run_hook, run_script, ScriptOutcome};

/// Filesystem roots a job needs: where to work and where to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub public_path: PathBuf,
    pub record_path: PathBuf,
}

impl From<&BaseConfig> for JobContext {
    fn from(base: &BaseConfig) -> Self {
        Self {
            public_path: base.public_path.clone(),
            record_path: base.record_path.clone(),
        }
    }
}

/// Snapshot of a job's mutable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobState {
    pub status: SyncStatus,
    pub last_change_time: DateTime<Local>,
}

/// How one tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Canceled,
}

pub struct SyncJob {
    name: MirrorName,
    context: JobContext,
    config: RwLock<Arc<MirrorConfig>>,
    state: Mutex<JobState>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SyncJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncJob")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

impl SyncJob {
    pub fn new(config: MirrorConfig, context: JobContext) -> Self {
        Self {
            name: config.name.clone(),
            context,
            config: RwLock::new(Arc::new(config)),
            state: Mutex::new(JobState {
                status: SyncStatus::NotPrepared,
                last_change_time: Local::now(),
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &MirrorName {
        &self.name
    }

    /// Current config snapshot. Never mutated in place; swaps replace the `Arc`.
    pub fn config(&self) -> Arc<MirrorConfig> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a new definition for the next tick. Returns `false` (and keeps
    /// the current snapshot) when nothing changed.
    pub fn replace_config(&self, config: MirrorConfig) -> bool {
        let mut guard = self.config.write().unwrap_or_else(PoisonError::into_inner);
        if **guard == config {
            return false;
        }
        *guard = Arc::new(config);
        true
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> SyncStatus {
        self.state().status
    }

    /// Fire the job's cancellation token. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `<public_path>/<name>`.
    pub fn work_dir(&self) -> PathBuf {
        chimata_core::types::work_dir_at(&self.context.public_path, &self.name)
    }

    /// Create the working directory if absent; fail if the path is taken by
    /// something other than a directory.
    pub async fn ensure_work_dir(&self) -> Result<PathBuf, JobError> {
        let dir = self.work_dir();
        ensure_dir(&dir).await?;
        Ok(dir)
    }

    /// One-time init phase. `Ok` means the job may be scheduled.
    pub async fn initialize(&self) -> Result<(), JobError> {
        self.transition(SyncStatus::NotPrepared);

        let work_dir = self.ensure_work_dir().await?;
        let config = self.config();
        if config.init_exec.trim().is_empty() {
            return Ok(());
        }

        tracing::info!("initializing mirror {}", self.name);
        match run_script(&config.init_exec, &work_dir, &self.cancel, config.timeout_duration()).await {
            ScriptOutcome::Success => {
                tracing::info!("initialized mirror {}", self.name);
                Ok(())
            }
            ScriptOutcome::Failure(err) => Err(JobError::Init(err)),
            ScriptOutcome::Canceled => Err(JobError::Canceled),
        }
    }

    /// One scheduled tick.
    pub async fn run(&self) -> RunOutcome {
        if self.is_canceled() {
            return RunOutcome::Canceled;
        }

        let config = self.config();
        tracing::info!("start syncing mirror {}", self.name);
        self.transition(SyncStatus::Syncing);

        let work_dir = match self.ensure_work_dir().await {
            Ok(dir) => dir,
            Err(err) => {
                tracing::error!("mirror {} cannot sync: {}", self.name, err);
                self.transition(SyncStatus::Failed);
                return RunOutcome::Failed;
            }
        };

        let timeout = config.timeout_duration();
        match run_script(&config.exec, &work_dir, &self.cancel, timeout).await {
            ScriptOutcome::Canceled => {
                tracing::info!("sync of mirror {} canceled", self.name);
                RunOutcome::Canceled
            }
            ScriptOutcome::Success => {
                self.transition(SyncStatus::Succeeded);
                tracing::info!("mirror {} synced successfully", self.name);
                run_hook("success", &self.name, &config.success_exec, &work_dir, &self.cancel, timeout)
                    .await;
                RunOutcome::Succeeded
            }
            ScriptOutcome::Failure(err) => {
                self.transition(SyncStatus::Failed);
                tracing::warn!("mirror {} sync failed: {}", self.name, err);
                run_hook("failure", &self.name, &config.fail_exec, &work_dir, &self.cancel, timeout)
                    .await;
                RunOutcome::Failed
            }
        }
    }

    /// Update in-memory state, then persist. Persistence is best-effort.
    ///
    /// A canceled job no longer owns its record file: a replacement job for
    /// the same mirror may already be writing it.
    fn transition(&self, status: SyncStatus) {
        let state = {
            let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            guard.status = status;
            guard.last_change_time = Local::now();
            *guard
        };
        if self.is_canceled() {
            tracing::debug!("mirror {} canceled, not persisting {}", self.name, status);
            return;
        }

        let record = StatusRecord {
            name: self.name.clone(),
            sync_status: state.status,
            last_change_time: state.last_change_time,
            period: self.config().period.clone(),
        };
        if let Err(err) = record::save_at(&self.context.record_path, &record) {
            tracing::warn!("failed to persist status of mirror {}: {}", self.name, err);
        }
    }
}

async fn ensure_dir(dir: &Path) -> Result<(), JobError> {
    match tokio::fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(JobError::NotADirectory {
            path: dir.to_path_buf(),
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| io_err(dir, e)),
        Err(err) => Err(io_err(dir, err)),
    }
}
