//! TOML configuration loading.
//!
//! # Layout
//!
//! ```text
//! config.toml                  [base] table + optional inline [[mirrors]]
//! <mirror_config_path>/
//!   debian.toml                one or more [[mirrors]] entries per file
//!   archlinux.toml
//! ```
//!
//! Relative `[base]` paths are resolved against the directory holding
//! `config.toml`. Mirror files are read in file-name order; inline mirrors
//! come first. The first definition of a name wins.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{config_io_err, ConfigError};
use crate::types::{BaseConfig, Config, MirrorConfig};

/// Default base config locations, searched in order.
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["./config.toml", "/etc/chimata/config.toml"];

#[derive(Debug, Deserialize)]
struct BaseFile {
    base: BaseConfig,
    #[serde(default)]
    mirrors: Vec<MirrorConfig>,
}

#[derive(Debug, Deserialize)]
struct MirrorFile {
    #[serde(default)]
    mirrors: Vec<MirrorConfig>,
}

/// Find the base config file among [`DEFAULT_CONFIG_PATHS`].
pub fn discover() -> Result<PathBuf, ConfigError> {
    let candidates: Vec<PathBuf> = DEFAULT_CONFIG_PATHS.iter().map(PathBuf::from).collect();
    discover_from(&candidates)
}

/// First candidate that exists and is a regular file.
pub fn discover_from(candidates: &[PathBuf]) -> Result<PathBuf, ConfigError> {
    candidates
        .iter()
        .find(|path| path.is_file())
        .cloned()
        .ok_or_else(|| ConfigError::NotFound {
            searched: candidates.to_vec(),
        })
}

/// Load `explicit` if given, otherwise the discovered default.
///
/// Returns the absolute path of the base file alongside the config so the
/// caller can watch it for changes.
pub fn load(explicit: Option<&Path>) -> Result<(PathBuf, Config), ConfigError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => discover()?,
    };
    let path = absolutize(&path)?;
    let config = load_at(&path)?;
    Ok((path, config))
}

/// Load the base file at `path` and every mirror file it points at.
pub fn load_at(path: &Path) -> Result<Config, ConfigError> {
    let path = absolutize(path)?;
    let contents = std::fs::read_to_string(&path).map_err(|e| config_io_err(&path, e))?;
    let file: BaseFile = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.clone(),
        source: e,
    })?;

    let config_dir = path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| ConfigError::Unresolvable { path: path.clone() })?;
    let base = resolve_base(file.base, &config_dir);

    let mut mirrors = file.mirrors;
    mirrors.extend(load_mirror_dir(&base.mirror_config_path, &path)?);

    Ok(Config {
        base,
        mirrors: validate_mirrors(mirrors),
    })
}

/// Parse every `*.toml` file in `dir` except `skip` (the base file, when the
/// two share a directory). A missing directory contributes no mirrors.
fn load_mirror_dir(dir: &Path, skip: &Path) -> Result<Vec<MirrorConfig>, ConfigError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %dir.display(), "mirror config directory does not exist");
            return Ok(vec![]);
        }
        Err(err) => return Err(config_io_err(dir, err)),
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_toml_file(p) && p.as_path() != skip)
        .collect();
    files.sort();

    let mut mirrors = Vec::new();
    for file in files {
        tracing::debug!(path = %file.display(), "loading mirror definitions");
        let contents = std::fs::read_to_string(&file).map_err(|e| config_io_err(&file, e))?;
        let parsed: MirrorFile = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: file.clone(),
            source: e,
        })?;
        mirrors.extend(parsed.mirrors);
    }
    Ok(mirrors)
}

/// `true` for regular files ending in `.toml`.
pub fn is_toml_file(path: &Path) -> bool {
    path.is_file() && has_toml_extension(path)
}

/// Extension check only; also matches paths that no longer exist.
pub fn has_toml_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false)
}

fn validate_mirrors(mirrors: Vec<MirrorConfig>) -> Vec<MirrorConfig> {
    let mut seen = HashSet::new();
    let mut valid = Vec::with_capacity(mirrors.len());
    for mirror in mirrors {
        if !mirror.name.is_valid() {
            tracing::warn!(name = %mirror.name, "skipping mirror with invalid name");
            continue;
        }
        if !seen.insert(mirror.name.clone()) {
            tracing::warn!(name = %mirror.name, "skipping duplicate mirror definition");
            continue;
        }
        valid.push(mirror);
    }
    valid
}

fn resolve_base(base: BaseConfig, config_dir: &Path) -> BaseConfig {
    let resolve = |p: PathBuf| {
        if p.is_absolute() {
            p
        } else {
            config_dir.join(p)
        }
    };
    BaseConfig {
        public_path: resolve(base.public_path),
        log_path: base.log_path.map(resolve),
        record_path: resolve(base.record_path),
        mirror_config_path: resolve(base.mirror_config_path),
        socket_path: base.socket_path.map(resolve),
    }
}

fn absolutize(path: &Path) -> Result<PathBuf, ConfigError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| config_io_err(path, e))?;
    Ok(cwd.join(path))
}
