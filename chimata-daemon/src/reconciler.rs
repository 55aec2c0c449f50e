//! Mark-and-sweep reconciliation of the live job set against a freshly
//! loaded [`Config`].
//!
//! 1. Mark: every configured mirror either swaps its config into the existing
//!    job (next tick sees it) or gets a new job inserted, unscheduled.
//! 2. Sweep: unmarked entries are canceled, detached from the dispatcher and
//!    dropped. Marks reset for the next pass.
//! 3. New jobs run their init phase as detached tasks. A reconcile never
//!    waits on `init_exec`; each init puts its job on the clock when it
//!    succeeds, provided the job is still the registered one.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use chimata_core::{Config, MirrorName, Schedule};
use chimata_sync::{JobContext, JobError, SyncJob};

use crate::dispatcher::{Dispatcher, ScheduleHandle};
use crate::registry::{JobRegistry, RegisteredJob};

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    /// New mirrors. Their init runs after the pass returns.
    pub added: Vec<MirrorName>,
    pub updated: Vec<MirrorName>,
    pub removed: Vec<MirrorName>,
    /// Mirrors whose period cannot be scheduled.
    pub unscheduled: Vec<MirrorName>,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.unscheduled.is_empty()
    }
}

pub struct Reconciler {
    registry: Arc<JobRegistry>,
    dispatcher: Arc<Dispatcher>,
    inits: Mutex<JoinSet<()>>,
}

impl Reconciler {
    pub fn new(registry: Arc<JobRegistry>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            registry,
            dispatcher,
            inits: Mutex::new(JoinSet::new()),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Apply `config` to the registry. Returns once the registry reflects the
    /// new mirror set; init scripts of added mirrors keep running afterwards.
    pub async fn reconcile(&self, config: &Config) -> ReconcileSummary {
        let context = JobContext::from(&config.base);
        let mut summary = ReconcileSummary::default();
        let mut fresh: Vec<Arc<SyncJob>> = Vec::new();

        {
            let mut jobs = self.registry.write().await;

            for mirror in &config.mirrors {
                if !jobs.contains_key(&mirror.name) {
                    let job = Arc::new(SyncJob::new(mirror.clone(), context.clone()));
                    jobs.insert(mirror.name.clone(), RegisteredJob::pending(Arc::clone(&job)));
                    summary.added.push(mirror.name.clone());
                    if Schedule::parse(&mirror.period).is_err() {
                        summary.unscheduled.push(mirror.name.clone());
                    }
                    fresh.push(job);
                    continue;
                }
                let Some(entry) = jobs.get_mut(&mirror.name) else { continue };

                entry.marked = true;
                let previous_period = entry.job.config().period.clone();
                if !entry.job.replace_config(mirror.clone()) {
                    continue;
                }
                summary.updated.push(mirror.name.clone());
                tracing::info!(mirror = %mirror.name, "mirror config updated");

                if entry.initialized && previous_period != mirror.period {
                    entry.handle = reschedule(&self.dispatcher, &entry.job, entry.handle.take());
                    if !entry.is_scheduled() {
                        summary.unscheduled.push(mirror.name.clone());
                    }
                }
            }

            jobs.retain(|name, entry| {
                if entry.marked {
                    entry.marked = false;
                    return true;
                }
                entry.job.cancel();
                if let Some(handle) = entry.handle.take() {
                    self.dispatcher.remove(handle);
                }
                tracing::info!(mirror = %name, "mirror removed");
                summary.removed.push(name.clone());
                false
            });
        }

        if !fresh.is_empty() {
            let mut inits = self.inits();
            // Reap what already finished so the set does not grow unbounded.
            while inits.try_join_next().is_some() {}
            for job in fresh {
                let registry = Arc::clone(&self.registry);
                let dispatcher = Arc::clone(&self.dispatcher);
                inits.spawn(initialize(registry, dispatcher, job));
            }
        }

        summary.added.sort();
        summary.updated.sort();
        summary.removed.sort();
        summary.unscheduled.sort();
        summary
    }

    /// Wait until every init started so far has finished.
    pub async fn settle(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.inits());
            if pending.is_empty() {
                return;
            }
            while let Some(joined) = pending.join_next().await {
                if let Err(err) = joined {
                    tracing::error!(error = %err, "init task failed");
                }
            }
        }
    }

    /// Cancel every job, wait for in-flight inits to unwind, stop the clock.
    pub async fn shutdown(&self) {
        self.registry.cancel_all().await;
        self.settle().await;
        self.dispatcher.stop().await;
    }

    fn inits(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.inits.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn initialize(registry: Arc<JobRegistry>, dispatcher: Arc<Dispatcher>, job: Arc<SyncJob>) {
    match job.initialize().await {
        Ok(()) => {
            if activate(&registry, &dispatcher, &job).await {
                tracing::info!(mirror = %job.name(), "mirror initialized");
            }
        }
        Err(JobError::Canceled) => {
            tracing::info!(mirror = %job.name(), "init canceled");
        }
        Err(err) => {
            tracing::error!(mirror = %job.name(), error = %err, "init failed, mirror will not be scheduled");
        }
    }
}

/// Record a successful init and put the job on the clock. Returns whether
/// the job is now scheduled. A job that was removed or replaced while its
/// init ran is left alone.
async fn activate(registry: &JobRegistry, dispatcher: &Dispatcher, job: &Arc<SyncJob>) -> bool {
    let mut jobs = registry.write().await;
    let Some(entry) = jobs.get_mut(job.name()) else {
        return false;
    };
    if !Arc::ptr_eq(&entry.job, job) || job.is_canceled() {
        return false;
    }
    entry.initialized = true;
    entry.handle = reschedule(dispatcher, job, entry.handle.take());
    entry.is_scheduled()
}

/// Attach `job` under its current period, reusing `existing` when given.
fn reschedule(
    dispatcher: &Dispatcher,
    job: &Arc<SyncJob>,
    existing: Option<ScheduleHandle>,
) -> Option<ScheduleHandle> {
    let period = job.config().period.clone();
    let schedule = match Schedule::parse(&period) {
        Ok(schedule) => schedule,
        Err(err) => {
            tracing::error!(mirror = %job.name(), period = %period, error = %err, "invalid period, mirror will not be scheduled");
            if let Some(handle) = existing {
                dispatcher.remove(handle);
            }
            return None;
        }
    };

    let handle = match existing.and_then(|handle| dispatcher.reschedule(handle, schedule.clone())) {
        Some(handle) => handle,
        None => dispatcher.add(Arc::clone(job), schedule),
    };
    tracing::info!(
        mirror = %job.name(),
        period = %period,
        next = ?dispatcher.next_fire(handle),
        "mirror scheduled"
    );
    Some(handle)
}
