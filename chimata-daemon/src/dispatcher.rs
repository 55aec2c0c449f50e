//! Recurring-schedule clock.
//!
//! A single clock task sleeps until the earliest next fire time across all
//! entries and dispatches each due job's `run` on its own task. Entry changes
//! and `stop` wake the clock early through a [`Notify`].
//!
//! Overlap policy: every entry carries a `running` flag. A tick (scheduled or
//! `run_now`) that finds it set is skipped, not queued. The flag is cleared by
//! a drop guard owned by the spawned task, so a panicking run still releases
//! it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use chimata_core::Schedule;
use chimata_sync::SyncJob;

/// Opaque ticket for one dispatcher entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleHandle(u64);

struct Entry {
    job: Arc<SyncJob>,
    schedule: Schedule,
    next: Option<DateTime<Local>>,
    running: Arc<AtomicBool>,
}

#[derive(Default)]
struct Shared {
    entries: Mutex<HashMap<ScheduleHandle, Entry>>,
    wake: Notify,
    next_id: AtomicU64,
}

impl Shared {
    fn entries(&self) -> MutexGuard<'_, HashMap<ScheduleHandle, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Clock {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    clock: Mutex<Option<Clock>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the clock task. No-op when already running.
    pub fn start(&self) {
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        if clock.is_some() {
            return;
        }
        let stop = CancellationToken::new();
        let task = tokio::spawn(clock_loop(Arc::clone(&self.shared), stop.clone()));
        *clock = Some(Clock { stop, task });
        tracing::debug!("dispatcher clock started");
    }

    /// Halt the clock and wait for it to finish. In-flight runs are left
    /// alone; cancel them through each job's token.
    pub async fn stop(&self) {
        let clock = self
            .clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(clock) = clock else { return };

        clock.stop.cancel();
        if let Err(err) = clock.task.await {
            tracing::error!(error = %err, "dispatcher clock task failed");
        }
        tracing::debug!("dispatcher clock stopped");
    }

    pub fn is_started(&self) -> bool {
        self.clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Attach `job` to the clock. Entries added before `start` fire once the
    /// clock runs.
    pub fn add(&self, job: Arc<SyncJob>, schedule: Schedule) -> ScheduleHandle {
        self.insert(job, schedule, Arc::new(AtomicBool::new(false)))
    }

    /// Detach an entry. Returns `false` for an unknown handle. A run already
    /// in flight is not affected.
    pub fn remove(&self, handle: ScheduleHandle) -> bool {
        let removed = self.shared.entries().remove(&handle).is_some();
        if removed {
            self.shared.wake.notify_one();
        }
        removed
    }

    /// Replace an entry's schedule. The new entry inherits the old one's
    /// overlap flag, so a run in flight still blocks ticks under the new
    /// handle.
    pub fn reschedule(&self, handle: ScheduleHandle, schedule: Schedule) -> Option<ScheduleHandle> {
        let old = self.shared.entries().remove(&handle)?;
        Some(self.insert(old.job, schedule, old.running))
    }

    /// Dispatch the entry right away under the overlap policy. Returns
    /// whether a run was started.
    pub fn run_now(&self, handle: ScheduleHandle) -> bool {
        let entries = self.shared.entries();
        match entries.get(&handle) {
            Some(entry) => dispatch(entry, "manual"),
            None => false,
        }
    }

    pub fn next_fire(&self, handle: ScheduleHandle) -> Option<DateTime<Local>> {
        self.shared.entries().get(&handle).and_then(|entry| entry.next)
    }

    pub fn is_running(&self, handle: ScheduleHandle) -> bool {
        self.shared
            .entries()
            .get(&handle)
            .map(|entry| entry.running.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.shared.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, job: Arc<SyncJob>, schedule: Schedule, running: Arc<AtomicBool>) -> ScheduleHandle {
        let handle = ScheduleHandle(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let next = schedule.next_after(Local::now());
        if next.is_none() {
            tracing::warn!(mirror = %job.name(), "schedule has no upcoming fire time");
        }
        self.shared.entries().insert(
            handle,
            Entry {
                job,
                schedule,
                next,
                running,
            },
        );
        self.shared.wake.notify_one();
        handle
    }
}

async fn clock_loop(shared: Arc<Shared>, stop: CancellationToken) {
    loop {
        let now = Local::now();
        let earliest = {
            let mut entries = shared.entries();
            let mut earliest: Option<DateTime<Local>> = None;
            for entry in entries.values_mut() {
                let Some(at) = entry.next else { continue };
                if at <= now {
                    dispatch(entry, "schedule");
                    entry.next = entry.schedule.next_after(now);
                }
                earliest = match (earliest, entry.next) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
            earliest
        };

        let wait = earliest.map(|at| (at - now).to_std().unwrap_or(Duration::ZERO));
        let sleep = async {
            match wait {
                Some(wait) => tokio::time::sleep(wait).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = shared.wake.notified() => {}
            _ = sleep => {}
        }
    }
}

/// Clears the overlap flag when the run task ends, however it ends.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn dispatch(entry: &Entry, trigger: &'static str) -> bool {
    if entry.running.swap(true, Ordering::AcqRel) {
        tracing::info!(
            mirror = %entry.job.name(),
            trigger,
            "previous run still in progress, skipping tick"
        );
        return false;
    }

    let guard = RunningGuard(Arc::clone(&entry.running));
    let job = Arc::clone(&entry.job);
    tokio::spawn(async move {
        let _guard = guard;
        let outcome = job.run().await;
        tracing::debug!(mirror = %job.name(), trigger, outcome = ?outcome, "run finished");
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chimata_core::{record, MirrorConfig, MirrorName, SyncStatus};
    use chimata_sync::JobContext;
    use tempfile::TempDir;

    fn job(root: &TempDir, name: &str, exec: &str) -> Arc<SyncJob> {
        let context = JobContext {
            public_path: root.path().join("public"),
            record_path: root.path().join("records"),
        };
        Arc::new(SyncJob::new(MirrorConfig::new(name, exec, "@every 1s"), context))
    }

    fn every(secs: u64) -> Schedule {
        Schedule::Every(Duration::from_secs(secs))
    }

    fn runs(root: &TempDir, name: &str) -> usize {
        std::fs::read_to_string(root.path().join("public").join(name).join("runs"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduled_tick_runs_job() {
        let root = TempDir::new().unwrap();
        let job = job(&root, "alpha", "exit 0");
        job.initialize().await.unwrap();

        let dispatcher = Dispatcher::new();
        dispatcher.add(Arc::clone(&job), every(1));
        dispatcher.start();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        dispatcher.stop().await;

        let stored = record::load_at(&root.path().join("records"), &MirrorName::from("alpha"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Succeeded);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_now_skips_while_previous_run_in_flight() {
        let root = TempDir::new().unwrap();
        let job = job(&root, "busy", "echo run >> runs; sleep 2");
        job.initialize().await.unwrap();

        let dispatcher = Dispatcher::new();
        let handle = dispatcher.add(Arc::clone(&job), every(3600));
        assert!(dispatcher.run_now(handle));
        assert!(!dispatcher.run_now(handle), "second trigger must be skipped");
        assert!(dispatcher.is_running(handle));

        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert!(!dispatcher.is_running(handle));
        assert_eq!(runs(&root, "busy"), 1);
        assert!(dispatcher.run_now(handle), "flag released after the run");
        job.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overlapping_scheduled_ticks_are_dropped() {
        let root = TempDir::new().unwrap();
        let job = job(&root, "slow", "echo run >> runs; sleep 3");
        job.initialize().await.unwrap();

        let dispatcher = Dispatcher::new();
        dispatcher.add(Arc::clone(&job), every(1));
        dispatcher.start();
        tokio::time::sleep(Duration::from_millis(2800)).await;
        dispatcher.stop().await;

        assert_eq!(runs(&root, "slow"), 1);
        job.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reschedule_keeps_overlap_flag() {
        let root = TempDir::new().unwrap();
        let job = job(&root, "moved", "sleep 2");
        job.initialize().await.unwrap();

        let dispatcher = Dispatcher::new();
        let old = dispatcher.add(Arc::clone(&job), every(3600));
        assert!(dispatcher.run_now(old));

        let new = dispatcher.reschedule(old, every(7200)).unwrap();
        assert_ne!(old, new);
        assert!(dispatcher.next_fire(old).is_none());
        assert!(dispatcher.next_fire(new).is_some());
        assert!(!dispatcher.run_now(new), "run started under the old handle still blocks");
        job.cancel();
    }

    #[tokio::test]
    async fn removed_entry_is_gone() {
        let root = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new();
        let handle = dispatcher.add(job(&root, "gone", "true"), every(60));
        assert_eq!(dispatcher.len(), 1);
        assert!(dispatcher.remove(handle));
        assert!(!dispatcher.remove(handle));
        assert!(dispatcher.is_empty());
        assert!(!dispatcher.run_now(handle));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_waits_for_clock() {
        let dispatcher = Dispatcher::new();
        dispatcher.start();
        dispatcher.start();
        assert!(dispatcher.is_started());
        dispatcher.stop().await;
        assert!(!dispatcher.is_started());
        dispatcher.stop().await;
    }
}
