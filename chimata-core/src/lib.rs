//! Chimata core library — mirror definitions, configuration, schedules, records.
//!
//! - [`types`]: newtypes, [`SyncStatus`], [`MirrorConfig`], [`BaseConfig`]
//! - [`config`]: TOML loading of the base file and mirror directory
//! - [`schedule`]: period expressions (cron lines and `@` descriptors)
//! - [`record`]: per-mirror status files
//! - [`error`]: [`ConfigError`], [`ScheduleError`], [`RecordError`]

pub mod config;
pub mod error;
pub mod record;
pub mod schedule;
pub mod types;

pub use error::{ConfigError, RecordError, ScheduleError};
pub use record::StatusRecord;
pub use schedule::Schedule;
pub use types::{BaseConfig, Config, MirrorConfig, MirrorName, SyncStatus};

/// File name of the control socket when `socket_path` is not configured.
pub const DEFAULT_SOCKET_NAME: &str = "chimata.sock";
