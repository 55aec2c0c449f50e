//! Per-mirror status records.
//!
//! Persists a [`StatusRecord`] JSON document at `<record_path>/<name>.json`.
//! Writes go to a uniquely named temp file in the same directory and are
//! renamed into place, so a crash mid-write never leaves a truncated record
//! and concurrent writers for one mirror never share a temp file.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::{record_io_err, RecordError};
use crate::types::{MirrorName, SyncStatus};

/// On-disk status payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub name: MirrorName,
    pub sync_status: SyncStatus,
    pub last_change_time: DateTime<Local>,
    #[serde(default)]
    pub period: String,
}

/// `<record_path>/<name>.json`. Pure, no I/O.
pub fn record_path_at(record_dir: &Path, name: &MirrorName) -> PathBuf {
    record_dir.join(format!("{}.json", name.0))
}

/// Save `record` atomically, creating `record_dir` if needed.
///
/// Writes to `.<name>.<random>.json.tmp` then renames over `<name>.json`.
/// The temp file is removed if anything fails before the rename.
pub fn save_at(record_dir: &Path, record: &StatusRecord) -> Result<(), RecordError> {
    std::fs::create_dir_all(record_dir).map_err(|e| record_io_err(record_dir, e))?;

    let path = record_path_at(record_dir, &record.name);
    let json = serde_json::to_string_pretty(record).map_err(|e| RecordError::Json {
        path: path.clone(),
        source: e,
    })?;

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{}.", record.name))
        .suffix(".json.tmp")
        .tempfile_in(record_dir)
        .map_err(|e| record_io_err(record_dir, e))?;
    tmp.write_all(json.as_bytes())
        .and_then(|()| tmp.flush())
        .map_err(|e| record_io_err(tmp.path(), e))?;
    tmp.persist(&path).map_err(|e| record_io_err(&path, e.error))?;
    Ok(())
}

/// Load the record for `name`, or `None` if it has never been written.
pub fn load_at(record_dir: &Path, name: &MirrorName) -> Result<Option<StatusRecord>, RecordError> {
    let path = record_path_at(record_dir, name);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(record_io_err(&path, e)),
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| RecordError::Json { path, source: e })
}

/// Every readable record under `record_dir`, sorted by name.
///
/// Unparseable files are skipped; a missing directory yields an empty list.
pub fn list_at(record_dir: &Path) -> Result<Vec<StatusRecord>, RecordError> {
    let entries = match std::fs::read_dir(record_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(record_io_err(record_dir, e)),
    };

    let mut records: Vec<StatusRecord> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|ext| ext.to_str()) == Some("json"))
        .filter_map(|p| std::fs::read_to_string(&p).ok())
        .filter_map(|contents| serde_json::from_str(&contents).ok())
        .collect();
    records.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(name: &str, status: SyncStatus) -> StatusRecord {
        StatusRecord {
            name: MirrorName::from(name),
            sync_status: status,
            last_change_time: Local::now(),
            period: "@hourly".to_string(),
        }
    }

    #[test]
    fn missing_record_loads_as_none() {
        let tmp = TempDir::new().unwrap();
        assert!(load_at(tmp.path(), &MirrorName::from("nope")).unwrap().is_none());
    }

    #[test]
    fn save_overwrites_and_cleans_tmp() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("records");
        save_at(&dir, &record("debian", SyncStatus::Syncing)).unwrap();
        save_at(&dir, &record("debian", SyncStatus::Succeeded)).unwrap();

        let loaded = load_at(&dir, &MirrorName::from("debian")).unwrap().unwrap();
        assert_eq!(loaded.sync_status, SyncStatus::Succeeded);
        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec!["debian.json"], "tmp files should be renamed away");
    }

    #[test]
    fn concurrent_writers_for_one_mirror_never_collide() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().to_path_buf();

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let dir = dir.clone();
                std::thread::spawn(move || {
                    let status = if i % 2 == 0 { SyncStatus::Succeeded } else { SyncStatus::NotPrepared };
                    for _ in 0..25 {
                        save_at(&dir, &record("debian", status)).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let loaded = load_at(&dir, &MirrorName::from("debian")).unwrap().unwrap();
        assert!(matches!(loaded.sync_status, SyncStatus::Succeeded | SyncStatus::NotPrepared));
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);
    }

    #[test]
    fn record_json_uses_snake_case_fields() {
        let tmp = TempDir::new().unwrap();
        save_at(tmp.path(), &record("alpha", SyncStatus::NotPrepared)).unwrap();
        let raw = std::fs::read_to_string(record_path_at(tmp.path(), &MirrorName::from("alpha"))).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["sync_status"], "not_prepared");
        assert!(value["last_change_time"].is_string());
    }

    #[test]
    fn list_skips_garbage_and_sorts() {
        let tmp = TempDir::new().unwrap();
        save_at(tmp.path(), &record("zeta", SyncStatus::Failed)).unwrap();
        save_at(tmp.path(), &record("alpha", SyncStatus::Succeeded)).unwrap();
        std::fs::write(tmp.path().join("broken.json"), "{not json").unwrap();

        let names: Vec<_> = list_at(tmp.path())
            .unwrap()
            .into_iter()
            .map(|r| r.name.0)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
