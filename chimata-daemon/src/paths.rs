use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

pub const LOG_FILE_NAME: &str = "chimata.log";

pub fn log_file_path(log_dir: &Path) -> PathBuf {
    log_dir.join(LOG_FILE_NAME)
}
