//! Error types for chimata-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML parse error. Includes file path and line context from `toml`.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// No base config file at any of the default locations.
    #[error("no configuration file found (searched: {})", display_paths(.searched))]
    NotFound { searched: Vec<PathBuf> },

    /// The base config file has no parent directory to resolve paths against.
    #[error("cannot resolve relative paths for config at {path}")]
    Unresolvable { path: PathBuf },
}

/// A period expression that cannot be scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("empty period expression")]
    Empty,

    #[error("expected 5 fields (minute hour day-of-month month day-of-week), found {found}")]
    FieldCount { found: usize },

    #[error("invalid {field} field '{value}': {reason}")]
    Field {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("unknown descriptor '{0}'")]
    UnknownDescriptor(String),

    #[error("invalid duration '{value}': {reason}")]
    Duration { value: String, reason: String },
}

/// All errors that can arise from status record persistence.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("status record JSON error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub(crate) fn config_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn record_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RecordError {
    RecordError::Io {
        path: path.into(),
        source,
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
