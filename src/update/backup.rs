//! Versioned backups of the installed binary.
//!
//! Layout under the backup root:
//!
//! ```text
//! v1.2.1/
//!   memdoc              copy of the binary that shipped as 1.2.1
//!   backup_info.json    version, date, original path, size, sha256
//! v1.2.1@20260314T101500/
//!   ...                 a different binary that also reported 1.2.1
//! ```
//!
//! A backup is built in a hidden temp directory and renamed into place, so a
//! half-written backup is never listed. An existing backup is never replaced:
//! an identical binary reuses it, a different one gets its own directory.
//! Backups are only removed on request.

use crate::config::{BackupEvent, BackupRecord, ConfigStore};
use crate::error::UpdateError;
use crate::update::installer::{PackageKind, StagedInstall, StagedOrigin};
use crate::update::integrity::sha256_file;
use crate::version::SemVer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const METADATA_FILE: &str = "backup_info.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    pub version: SemVer,
    pub created_at: DateTime<Utc>,
    pub binary_path: PathBuf,
    pub metadata_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupMetadata {
    version: String,
    backup_date: DateTime<Utc>,
    exe_path: PathBuf,
    exe_name: String,
    exe_size: u64,
    #[serde(default)]
    sha256: Option<String>,
}

pub struct BackupStore {
    root: PathBuf,
    config: Option<Arc<ConfigStore>>,
}

impl BackupStore {
    /// Store backups under `root`, created on first use.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config: None,
        }
    }

    /// Record created/restored/removed events in the config's backup history.
    pub fn with_history(mut self, config: Arc<ConfigStore>) -> Self {
        self.config = Some(config);
        self
    }

    /// First free directory for a new backup of `version`.
    fn new_version_dir(&self, version: &SemVer, at: DateTime<Utc>) -> PathBuf {
        let plain = self.root.join(format!("v{}", version));
        if !plain.exists() {
            return plain;
        }
        let stamp = at.format("%Y%m%dT%H%M%S");
        let mut dir = self.root.join(format!("v{}@{}", version, stamp));
        let mut n = 1;
        while dir.exists() {
            n += 1;
            dir = self.root.join(format!("v{}@{}-{}", version, stamp, n));
        }
        dir
    }

    /// Valid backups of `version`, newest first.
    fn backups_of(&self, version: &SemVer) -> Vec<(Backup, BackupMetadata)> {
        let mut found: Vec<(Backup, BackupMetadata)> = backup_dirs(&self.root)
            .iter()
            .filter_map(|dir| load_backup(dir))
            .filter(|(backup, _)| backup.version == *version)
            .collect();
        found.sort_by(|a, b| b.0.created_at.cmp(&a.0.created_at));
        found
    }

    /// Copy `current_binary` aside as the backup for `version`.
    pub fn create_backup(
        &self,
        current_binary: &Path,
        version: &SemVer,
    ) -> Result<Backup, UpdateError> {
        let fail = |what: &str, e: &dyn std::fmt::Display| {
            UpdateError::BackupCreation(format!("{}: {}", what, e))
        };

        let exe_name = current_binary
            .file_name()
            .ok_or_else(|| fail("invalid binary path", &current_binary.display()))?
            .to_owned();
        let current_sha = sha256_file(current_binary).map_err(|e| fail("hashing binary", &e))?;
        if let Some((existing, _)) = self
            .backups_of(version)
            .into_iter()
            .find(|(_, meta)| meta.sha256.as_deref() == Some(current_sha.as_str()))
        {
            debug!(%version, path = %existing.binary_path.display(), "identical backup already exists");
            return Ok(existing);
        }

        let staging = self.root.join(format!(".v{}.tmp", version));
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| fail("clearing stale backup", &e))?;
        }
        fs::create_dir_all(&staging).map_err(|e| fail("creating backup directory", &e))?;

        let staged_binary = staging.join(&exe_name);
        let exe_size = fs::copy(current_binary, &staged_binary)
            .map_err(|e| fail("copying binary", &e))?;
        let sha256 = sha256_file(&staged_binary).map_err(|e| fail("hashing backup", &e))?;
        if sha256 != current_sha {
            let _ = fs::remove_dir_all(&staging);
            return Err(fail("copying binary", &"copy does not match the running binary"));
        }

        let metadata = BackupMetadata {
            version: version.to_string(),
            backup_date: Utc::now(),
            exe_path: current_binary.to_path_buf(),
            exe_name: exe_name.to_string_lossy().into_owned(),
            exe_size,
            sha256: Some(sha256),
        };
        let json = serde_json::to_string_pretty(&metadata)
            .map_err(|e| fail("encoding metadata", &e))?;
        fs::write(staging.join(METADATA_FILE), json).map_err(|e| fail("writing metadata", &e))?;

        let dir = self.new_version_dir(version, metadata.backup_date);
        fs::rename(&staging, &dir).map_err(|e| fail("finalizing backup", &e))?;

        let backup = Backup {
            version: version.clone(),
            created_at: metadata.backup_date,
            binary_path: dir.join(&exe_name),
            metadata_path: dir.join(METADATA_FILE),
        };
        info!(%version, path = %dir.display(), bytes = exe_size, "backup created");
        self.record(version, BackupEvent::Created, &dir);
        Ok(backup)
    }

    /// All structurally valid backups, newest first.
    pub fn list_backups(&self) -> Result<Vec<Backup>, UpdateError> {
        match fs::metadata(&self.root) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(UpdateError::io(&self.root, e)),
        }

        let mut backups: Vec<Backup> = backup_dirs(&self.root)
            .iter()
            .filter_map(|dir| load_backup(dir).map(|(backup, _)| backup))
            .collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    /// Stage the newest intact backup of `version` for installation.
    ///
    /// The backup itself is never moved; the installer copies from it.
    pub fn restore(&self, version: &SemVer) -> Result<StagedInstall, UpdateError> {
        let candidates = self.backups_of(version);
        if candidates.is_empty() {
            return Err(UpdateError::BackupNotFound(version.to_string()));
        }

        for (backup, metadata) in candidates {
            if let Some(expected) = &metadata.sha256 {
                let actual = sha256_file(&backup.binary_path)
                    .map_err(|e| UpdateError::io(&backup.binary_path, e))?;
                if !actual.eq_ignore_ascii_case(expected) {
                    warn!(%version, path = %backup.binary_path.display(), "backup binary does not match its recorded checksum");
                    continue;
                }
            }

            let dir = backup
                .metadata_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.root.clone());
            info!(%version, path = %dir.display(), "backup staged for rollback");
            self.record(version, BackupEvent::Restored, &dir);
            return Ok(StagedInstall {
                package: backup.binary_path,
                version: backup.version,
                kind: PackageKind::Binary,
                origin: StagedOrigin::Backup,
            });
        }

        Err(UpdateError::BackupNotFound(format!(
            "{} (checksum mismatch)",
            version
        )))
    }

    /// Delete every backup of `version`. Only ever called on user request.
    pub fn remove(&self, version: &SemVer) -> Result<(), UpdateError> {
        let dirs: Vec<PathBuf> = backup_dirs(&self.root)
            .into_iter()
            .filter(|dir| dir_version(dir).as_ref() == Some(version))
            .collect();
        if dirs.is_empty() {
            return Err(UpdateError::BackupNotFound(version.to_string()));
        }
        for dir in dirs {
            fs::remove_dir_all(&dir).map_err(|e| UpdateError::io(&dir, e))?;
            info!(%version, path = %dir.display(), "backup removed");
            self.record(version, BackupEvent::Removed, &dir);
        }
        Ok(())
    }

    fn record(&self, version: &SemVer, event: BackupEvent, dir: &Path) {
        let Some(config) = &self.config else {
            return;
        };
        let record = BackupRecord {
            version: version.clone(),
            event,
            at: Utc::now(),
            path: dir.to_path_buf(),
        };
        if let Err(e) = config.record_backup(record) {
            warn!(error = %e, "failed to record backup history");
        }
    }
}

/// Directories under `root` that look like backups (`v<version>[@<stamp>]`).
fn backup_dirs(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && dir_version(path).is_some())
        .collect()
}

/// Version encoded in a backup directory name.
fn dir_version(dir: &Path) -> Option<SemVer> {
    let name = dir.file_name()?.to_str()?.strip_prefix('v')?;
    let version = name.split_once('@').map_or(name, |(v, _)| v);
    SemVer::parse(version).ok()
}

/// Load a backup directory if it is valid: metadata parses, its version
/// matches the directory name, and the binary exists with the recorded size.
fn load_backup(dir: &Path) -> Option<(Backup, BackupMetadata)> {
    let dir_version = dir_version(dir)?;

    let metadata_path = dir.join(METADATA_FILE);
    let content = fs::read_to_string(&metadata_path).ok()?;
    let metadata: BackupMetadata = match serde_json::from_str(&content) {
        Ok(m) => m,
        Err(e) => {
            debug!(path = %metadata_path.display(), error = %e, "ignoring unreadable backup metadata");
            return None;
        }
    };

    let recorded = SemVer::parse(&metadata.version).ok()?;
    if recorded != dir_version {
        debug!(dir = %dir.display(), %recorded, "backup metadata version mismatch");
        return None;
    }

    let binary_path = dir.join(&metadata.exe_name);
    let size = fs::metadata(&binary_path).ok()?.len();
    if size != metadata.exe_size {
        debug!(path = %binary_path.display(), "backup binary size mismatch");
        return None;
    }

    Some((
        Backup {
            version: recorded,
            created_at: metadata.backup_date,
            binary_path,
            metadata_path,
        },
        metadata,
    ))
}
