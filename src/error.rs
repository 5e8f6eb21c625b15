//! Error taxonomy for the update and relocation engines.
//!
//! Every variant carries owned strings so errors can be cloned into status
//! snapshots. A poll never fails; it reports a state that embeds one of these.

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while checking, downloading, backing up or installing an update.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    /// Transient transport failure. Safe to retry.
    #[error("network error: {0}")]
    Network(String),

    /// The registry answered but the release descriptor could not be understood.
    #[error("invalid release descriptor: {0}")]
    InvalidDescriptor(String),

    /// No release carries an installable asset for this platform.
    #[error("no release provides a package for {platform}")]
    NoCompatibleAsset { platform: String },

    /// The downloaded file failed the integrity check.
    #[error("corrupt package: {0}")]
    CorruptPackage(String),

    /// The release publishes no digest, so the package cannot be checked byte for byte.
    #[error("package cannot be verified: {0}")]
    Unverifiable(String),

    /// No bytes arrived within the stall timeout.
    #[error("download stalled: no data received for {secs}s")]
    Stalled { secs: u64 },

    /// A download session is already in progress.
    #[error("a download is already in progress")]
    AlreadyDownloading,

    /// The referenced download session is not the current one.
    #[error("unknown download session {0}")]
    UnknownSession(u64),

    #[error("operation cancelled")]
    Cancelled,

    /// Copying the running binary aside failed; nothing was replaced.
    #[error("backup failed: {0}")]
    BackupCreation(String),

    #[error("no valid backup found for version {0}")]
    BackupNotFound(String),

    /// The installer could not be launched; the binary was not replaced.
    #[error("installer handoff failed: {0}")]
    InstallHandoff(String),

    /// The requested action is not allowed from the current orchestrator state.
    #[error("cannot {action} while {state}")]
    InvalidTransition { action: &'static str, state: String },

    #[error("I/O error on {path}: {message}")]
    Io { path: PathBuf, message: String },
}

impl UpdateError {
    pub(crate) fn io(path: &Path, err: std::io::Error) -> Self {
        UpdateError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    /// Whether the failed attempt can be repeated from scratch without user attention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpdateError::Network(_)
                | UpdateError::Stalled { .. }
                | UpdateError::CorruptPackage(_)
                | UpdateError::Cancelled
        )
    }
}

/// Reasons a destination directory is rejected for relocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("this is already your current data directory")]
    SameAsActive,

    #[error("path exists but is not a directory")]
    NotADirectory,

    #[error("destination not empty: contains {entries} item(s)")]
    NotEmpty { entries: usize },

    #[error("destination is inside the current data directory")]
    InsideSource,

    #[error("current data directory is inside the destination")]
    ContainsSource,

    #[error("parent directory does not exist: {0}")]
    ParentMissing(PathBuf),

    #[error("destination is not writable: {0}")]
    NotWritable(String),

    #[error("insufficient disk space: need {needed} bytes, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("current data directory is missing: {0}")]
    SourceMissing(PathBuf),
}

/// Phase of a migration job in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStage {
    Validating,
    Copying,
    Verifying,
    Committing,
}

impl fmt::Display for MigrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationStage::Validating => "validate",
            MigrationStage::Copying => "copy",
            MigrationStage::Verifying => "verify",
            MigrationStage::Committing => "commit",
        };
        f.write_str(s)
    }
}

/// Errors raised by the data relocator. None of them leave the source modified.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("a migration is already in progress")]
    AlreadyInProgress,

    /// Copy aborted mid-tree; the partial destination is left for inspection.
    #[error("copy failed at {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    #[error("migration cancelled")]
    Cancelled,

    /// The verified destination could not be recorded as active.
    #[error("could not record new data directory: {0}")]
    Commit(String),
}

impl MigrationError {
    pub(crate) fn io(path: &Path, err: impl fmt::Display) -> Self {
        MigrationError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    pub fn stage(&self) -> MigrationStage {
        match self {
            MigrationError::Validation(_) | MigrationError::AlreadyInProgress => {
                MigrationStage::Validating
            }
            MigrationError::Io { .. } | MigrationError::Cancelled => MigrationStage::Copying,
            MigrationError::IntegrityCheckFailed(_) => MigrationStage::Verifying,
            MigrationError::Commit(_) => MigrationStage::Committing,
        }
    }

    /// The source tree is never modified by the relocator, whatever the failure.
    pub fn data_at_risk(&self) -> bool {
        false
    }
}
