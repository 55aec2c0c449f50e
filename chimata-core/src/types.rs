//! Domain types for Chimata mirror definitions and sync state.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.
//! Everything that crosses the config or record boundary derives serde.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed mirror name. Doubles as the working-directory name under
/// `public_path` and the record file stem under `record_path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MirrorName(pub String);

impl MirrorName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A name is usable when it is a single, non-empty path component.
    pub fn is_valid(&self) -> bool {
        let name = self.0.as_str();
        !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains('/')
            && !name.contains('\\')
            && !name.contains('\0')
    }
}

impl fmt::Display for MirrorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for MirrorName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MirrorName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Sync state of one mirror.
///
/// `NotPrepared → Syncing → {Succeeded, Failed}`, and `Syncing` again on the
/// next tick from either terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    NotPrepared,
    Syncing,
    Succeeded,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::NotPrepared => "not_prepared",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Succeeded => "succeeded",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_prepared" => Ok(SyncStatus::NotPrepared),
            "syncing" => Ok(SyncStatus::Syncing),
            "succeeded" => Ok(SyncStatus::Succeeded),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(format!("unknown sync status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Config structs
// ---------------------------------------------------------------------------

/// One mirror definition, as read from configuration.
///
/// Empty script bodies mean "skip that phase".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub name: MirrorName,
    #[serde(default)]
    pub init_exec: String,
    #[serde(default)]
    pub exec: String,
    #[serde(default)]
    pub success_exec: String,
    #[serde(default)]
    pub fail_exec: String,
    pub period: String,
    /// Per-script timeout in whole seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl MirrorConfig {
    /// Minimal definition with only `exec` and `period` set.
    pub fn new(name: impl Into<MirrorName>, exec: impl Into<String>, period: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            init_exec: String::new(),
            exec: exec.into(),
            success_exec: String::new(),
            fail_exec: String::new(),
            period: period.into(),
            timeout: None,
        }
    }

    /// Per-script time limit. `timeout = 0` means unlimited, same as unset.
    pub fn timeout_duration(&self) -> Option<std::time::Duration> {
        self.timeout
            .filter(|secs| *secs > 0)
            .map(std::time::Duration::from_secs)
    }
}

/// Process-wide paths from the `[base]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseConfig {
    /// Root of per-mirror working directories.
    pub public_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    /// Root of per-mirror status records.
    pub record_path: PathBuf,
    /// Directory of `*.toml` mirror definition files.
    pub mirror_config_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
}

impl BaseConfig {
    /// Control socket location; defaults to `<record_path>/chimata.sock`.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| self.record_path.join(crate::DEFAULT_SOCKET_NAME))
    }

    /// Working directory for a mirror: `<public_path>/<name>`.
    pub fn work_dir(&self, name: &MirrorName) -> PathBuf {
        work_dir_at(&self.public_path, name)
    }
}

/// `<public_path>/<name>`. Pure, no I/O.
pub fn work_dir_at(public_path: &Path, name: &MirrorName) -> PathBuf {
    public_path.join(&name.0)
}

/// Fully loaded configuration: base paths plus every mirror definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub base: BaseConfig,
    pub mirrors: Vec<MirrorConfig>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
