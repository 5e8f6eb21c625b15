//! The persisted config store.
//!
//! Constructed once at startup and shared as `Arc<ConfigStore>`. Every
//! mutation is written to disk (temp file + rename) before it becomes visible
//! in memory, so a failed save never leaves the two disagreeing.

use crate::config::error::ConfigError;
use crate::config::paths;
use crate::config::types::{
    ActiveDataPointer, BackupRecord, MigrationRecord, PersistedConfig, UpdateSettings,
};
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    state: Mutex<PersistedConfig>,
}

impl ConfigStore {
    /// Open the config at the default location.
    pub fn open_default() -> Result<Self, ConfigError> {
        let path = paths::config_path().ok_or(ConfigError::NoHome)?;
        Self::open(path)
    }

    /// Open `path`, creating it with defaults on first run.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Self::open_or_init(path.into(), paths::default_data_dir)
    }

    /// Like [`open`](Self::open), but a freshly created config points at `data_dir`.
    pub fn open_or_init(
        path: PathBuf,
        data_dir: impl FnOnce() -> PathBuf,
    ) -> Result<Self, ConfigError> {
        let state = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| ConfigError::from_json(path.clone(), e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = PersistedConfig::with_data_dir(data_dir());
                persist(&path, &config)?;
                tracing::info!(path = %path.display(), "created default config");
                config
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the config, backups and staging area.
    pub fn home(&self) -> PathBuf {
        paths::home_for_config(&self.path)
    }

    pub fn snapshot(&self) -> PersistedConfig {
        self.lock().clone()
    }

    pub fn active_data(&self) -> ActiveDataPointer {
        self.lock().data_directory.clone()
    }

    pub fn update_settings(&self) -> UpdateSettings {
        self.lock().update.clone()
    }

    pub fn backup_history(&self) -> Vec<BackupRecord> {
        self.lock().backups.clone()
    }

    pub fn record_backup(&self, record: BackupRecord) -> Result<(), ConfigError> {
        self.mutate(|config| config.backups.push(record))
    }

    /// Point the active data pointer at `destination`.
    ///
    /// Only the relocator calls this, and only after the destination verified.
    pub(crate) fn commit_data_dir(
        &self,
        destination: &Path,
        files: u64,
    ) -> Result<(), ConfigError> {
        self.mutate(|config| {
            let now = Utc::now();
            config.last_migration = Some(MigrationRecord {
                from: config.data_directory.path.clone(),
                to: destination.to_path_buf(),
                files,
                at: now,
            });
            config.data_directory = ActiveDataPointer {
                path: destination.to_path_buf(),
                last_verified_at: Some(now),
            };
        })
    }

    fn mutate(&self, apply: impl FnOnce(&mut PersistedConfig)) -> Result<(), ConfigError> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        apply(&mut next);
        persist(&self.path, &next)?;
        *guard = next;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, PersistedConfig> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Write `config` atomically: temp file in the same directory, fsync, rename.
fn persist(path: &Path, config: &PersistedConfig) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| io_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp).map_err(io_err)?;
    file.write_all(content.as_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);

    fs::rename(&tmp, path).map_err(io_err)
}
