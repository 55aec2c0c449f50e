pub mod check;
pub mod daemon;
pub mod status;
pub mod sync;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chimata_core::{config, Config};
use chimata_daemon::DaemonClient;

/// Locate and load configuration, explicit path first.
pub fn load_config(explicit: Option<&Path>) -> Result<(PathBuf, Config)> {
    config::load(explicit).context("failed to load configuration")
}

/// Client for the daemon described by the configuration.
pub fn client(explicit: Option<&Path>) -> Result<DaemonClient> {
    let (_, config) = load_config(explicit)?;
    Ok(DaemonClient::new(config.base.socket_path()))
}
