//! Configuration file loading.
//!
//! The loader only gets the document off disk and through serde; the
//! comprehensive validator, the secrets pass and snapshot construction
//! all run afterwards, in that order, before anything serves traffic.
//! Two guards run before a single byte is parsed: the resolved path must
//! stay inside the working directory (symlinks followed), and the file
//! is capped at 10 MB.

use crate::models::settings::Settings;
use log::debug;
use std::path::{Path, PathBuf};
use thiserror::Error;

const MAX_CONFIG_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("config file {path} does not exist or cannot be resolved")]
    NotFound { path: String },
    #[error("config file {path} resolves outside the working directory")]
    OutsideWorkingDir { path: String },
    #[error("config file {path} is {size} bytes; the limit is {limit}")]
    TooLarge { path: String, size: u64, limit: u64 },
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("config file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Where the configuration lives: `PORTICO_CONFIG_PATH`, defaulting to
/// `./config.json`.
pub fn config_path() -> PathBuf {
    std::env::var_os("PORTICO_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./config.json"))
}

/// Loads the configuration document from the configured path.
pub fn load_settings() -> Result<Settings, SettingsError> {
    let path = config_path();
    debug!("Loading configuration from {}", path.display());

    let raw = read_confined(&path)?;
    let settings: Settings = serde_json::from_str(&raw)?;

    debug!(
        "Parsed {} routes and {} upstreams from {}",
        settings.routes.len(),
        settings.upstreams.len(),
        path.display()
    );
    Ok(settings)
}

/// Reads a file after enforcing the confinement and size guards.
fn read_confined(path: &Path) -> Result<String, SettingsError> {
    let shown = path.display().to_string();

    // canonicalize both resolves symlinks and proves existence in one go.
    let resolved = path.canonicalize().map_err(|_| SettingsError::NotFound {
        path: shown.clone(),
    })?;
    let root = std::env::current_dir()?;
    if !resolved.starts_with(&root) {
        return Err(SettingsError::OutsideWorkingDir { path: shown });
    }

    let size = std::fs::metadata(&resolved)?.len();
    if size > MAX_CONFIG_BYTES {
        return Err(SettingsError::TooLarge {
            path: shown,
            size,
            limit: MAX_CONFIG_BYTES,
        });
    }

    Ok(std::fs::read_to_string(&resolved)?)
}
