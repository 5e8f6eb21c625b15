//! Persisted config types for memdoc.
//!
//! Mirrors `config.json`. Every field has a default so that files written by
//! older versions load without migration.

use crate::version::SemVer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Current config schema version.
pub const SCHEMA_VERSION: u32 = 2;

/// The whole config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedConfig {
    #[serde(default = "default_schema")]
    pub version: u32,
    /// Where the user's data lives right now.
    pub data_directory: ActiveDataPointer,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_migration: Option<MigrationRecord>,
    /// Backups created or restored, oldest first.
    #[serde(default)]
    pub backups: Vec<BackupRecord>,
    #[serde(default)]
    pub update: UpdateSettings,
}

fn default_schema() -> u32 {
    SCHEMA_VERSION
}

impl PersistedConfig {
    pub fn with_data_dir(path: PathBuf) -> Self {
        Self {
            version: SCHEMA_VERSION,
            data_directory: ActiveDataPointer {
                path,
                last_verified_at: None,
            },
            created_at: Utc::now(),
            last_migration: None,
            backups: Vec::new(),
            update: UpdateSettings::default(),
        }
    }
}

/// Single source of truth for the data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveDataPointer {
    pub path: PathBuf,
    /// When a relocation last verified this directory. `None` for the initial location.
    #[serde(default)]
    pub last_verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub from: PathBuf,
    pub to: PathBuf,
    pub files: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupEvent {
    Created,
    Restored,
    Removed,
}

/// One entry of the backup history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub version: SemVer,
    pub event: BackupEvent,
    pub at: DateTime<Utc>,
    pub path: PathBuf,
}

/// Update engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateSettings {
    /// Release index endpoint (GitHub Releases API shape).
    pub registry_url: String,
    pub include_prereleases: bool,
    /// Abort a download when no bytes arrive for this long.
    pub stall_timeout_secs: u64,
    /// Packages smaller than this are treated as corrupt.
    pub min_package_bytes: u64,
    /// Accept packages from releases that publish no SHA-256 digest.
    pub allow_unverified: bool,
    pub retry: RetrySettings,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            registry_url: "https://api.github.com/repos/swahed/memdoc/releases".to_string(),
            include_prereleases: false,
            stall_timeout_secs: 30,
            min_package_bytes: 1024 * 1024,
            allow_unverified: false,
            retry: RetrySettings::default(),
        }
    }
}

/// Bounded exponential backoff for registry checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 4000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_file_gets_defaults() {
        let json = r#"{ "data_directory": { "path": "/srv/memdoc" } }"#;
        let config: PersistedConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.data_directory.path, PathBuf::from("/srv/memdoc"));
        assert_eq!(config.version, SCHEMA_VERSION);
        assert!(config.backups.is_empty());
        assert_eq!(config.update.retry.max_attempts, 3);
        assert_eq!(config.update.stall_timeout_secs, 30);
        assert!(!config.update.allow_unverified);
    }

    #[test]
    fn test_partial_update_block() {
        let json = r#"{
            "data_directory": { "path": "/d" },
            "update": { "registry_url": "http://localhost/releases" }
        }"#;
        let config: PersistedConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.update.registry_url, "http://localhost/releases");
        assert_eq!(config.update.min_package_bytes, 1024 * 1024);
    }

    #[test]
    fn test_backup_event_names() {
        let json = serde_json::to_string(&BackupEvent::Restored).unwrap();
        assert_eq!(json, "\"restored\"");
    }
}
