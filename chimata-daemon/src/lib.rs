//! Daemon runtime: dispatcher clock, job registry, reconciler, config
//! watcher and control socket.

pub mod dispatcher;
mod error;
pub mod paths;
pub mod protocol;
pub mod reconciler;
pub mod registry;
mod runtime;

pub use dispatcher::{Dispatcher, ScheduleHandle};
pub use error::DaemonError;
pub use protocol::{DaemonClient, DaemonRequest, DaemonResponse};
pub use reconciler::{ReconcileSummary, Reconciler};
pub use registry::{JobRegistry, JobView, RegisteredJob};
pub use runtime::{init_tracing, run, start_blocking};
