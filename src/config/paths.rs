//! Well-known locations for memdoc.
//!
//! Everything the updater owns lives under `~/.memdoc/`, outside both the
//! installation directory and the user's data directory:
//!
//! ```text
//! ~/.memdoc/
//!   config.json         active data pointer, backup history, settings
//!   instance.lock       single-instance lock
//!   update_check.json   cached registry answer
//!   backups/v<ver>/     binary backups
//!   downloads/          package staging area
//! ```

use std::path::{Path, PathBuf};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "MEMDOC_CONFIG";

/// Get the memdoc home directory: ~/.memdoc/
pub fn memdoc_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".memdoc"))
}

/// Config file path, honouring `MEMDOC_CONFIG`.
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    memdoc_dir().map(|p| p.join("config.json"))
}

/// Directory owning a given config file; backups and downloads hang off it.
pub fn home_for_config(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn backup_dir(home: &Path) -> PathBuf {
    home.join("backups")
}

pub fn staging_dir(home: &Path) -> PathBuf {
    home.join("downloads")
}

pub fn update_cache_path(home: &Path) -> PathBuf {
    home.join("update_check.json")
}

/// Default data directory for a fresh install: `<data_dir>/MemDoc/data`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .map(|p| p.join("MemDoc").join("data"))
        .unwrap_or_else(|| PathBuf::from("data"))
}
