//! # chimata-sync
//!
//! Script execution and the per-mirror job state machine.
//!
//! [`run_script`] executes one script with cancellation and timeout;
//! [`SyncJob`] drives a mirror through init, sync and hook phases and
//! records every status transition.

pub mod error;
pub mod job;
pub mod runner;

pub use error::{JobError, ScriptError};
pub use job::{JobContext, JobState, RunOutcome, SyncJob};
pub use runner::{run_hook, run_script, ScriptOutcome};
pub use tokio_util::sync::CancellationToken;
