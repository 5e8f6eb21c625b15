//! Self-update for memdoc.
//!
//! Registry check, package download and verification, versioned backups,
//! installer handoff and rollback, tied together by [`UpdateOrchestrator`].

pub mod backup;
pub mod cache;
pub mod detection;
pub mod download;
pub mod installer;
pub mod integrity;
pub mod orchestrator;
pub mod registry;

pub use backup::{Backup, BackupStore};
pub use cache::CachedSource;
pub use download::{DownloadRequest, DownloadSession, DownloadState, PackageDownloader, SessionHandle};
pub use installer::{Installer, PlatformInstaller, StagedInstall};
pub use orchestrator::{FailureStage, UpdateOrchestrator, UpdateState};
pub use registry::{Platform, ReleaseRegistryClient, ReleaseSource};

/// How memdoc was installed, affecting how updates should be performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallMethod {
    /// Installed from a release download. Can replace itself.
    SelfManaged,
    /// Installed via a package manager. The user should update through it.
    PackageManager { name: String, upgrade_cmd: String },
    /// Built from source with cargo.
    Development,
}
