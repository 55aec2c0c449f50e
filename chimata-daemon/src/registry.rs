//! Live job set, keyed by mirror name.
//!
//! The map sits behind one async reader/writer lock. Status queries take the
//! shared side; the reconciler is the only writer. No lock is held while a
//! job runs.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chimata_core::MirrorName;
use chimata_sync::SyncJob;

use crate::dispatcher::ScheduleHandle;

#[derive(Debug)]
pub struct RegisteredJob {
    pub job: Arc<SyncJob>,
    /// `None` while init is pending, after init failed, or when the period
    /// cannot be scheduled.
    pub handle: Option<ScheduleHandle>,
    /// Init phase finished successfully.
    pub initialized: bool,
    pub(crate) marked: bool,
}

impl RegisteredJob {
    pub(crate) fn pending(job: Arc<SyncJob>) -> Self {
        Self {
            job,
            handle: None,
            initialized: false,
            marked: true,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.handle.is_some()
    }
}

/// Point-in-time view of one registry entry.
#[derive(Debug, Clone)]
pub struct JobView {
    pub job: Arc<SyncJob>,
    pub handle: Option<ScheduleHandle>,
}

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<MirrorName, RegisteredJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, HashMap<MirrorName, RegisteredJob>> {
        self.jobs.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, HashMap<MirrorName, RegisteredJob>> {
        self.jobs.write().await
    }

    pub async fn get(&self, name: &MirrorName) -> Option<JobView> {
        self.jobs.read().await.get(name).map(|entry| JobView {
            job: Arc::clone(&entry.job),
            handle: entry.handle,
        })
    }

    /// Every entry, sorted by mirror name.
    pub async fn snapshot(&self) -> Vec<JobView> {
        let jobs = self.jobs.read().await;
        let mut views: Vec<JobView> = jobs
            .values()
            .map(|entry| JobView {
                job: Arc::clone(&entry.job),
                handle: entry.handle,
            })
            .collect();
        views.sort_by(|a, b| a.job.name().cmp(b.job.name()));
        views
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Fire every job's cancellation token.
    pub async fn cancel_all(&self) {
        for entry in self.jobs.read().await.values() {
            entry.job.cancel();
        }
    }
}
