//! Update orchestrator.
//!
//! Drives one update attempt through
//! `Idle → Checking → UpdateFound → Downloading → Downloaded → BackingUp →
//! Installing → Restarting`. Every method is synchronous apart from the
//! download, which runs on the downloader's worker and is observed through
//! [`UpdateOrchestrator::poll`]. A failed attempt parks in `Failed` until the
//! caller checks again or cancels back to `Idle`; nothing from the failed
//! attempt is carried forward.

use crate::commit::Staged;
use crate::error::UpdateError;
use crate::update::backup::{Backup, BackupStore};
use crate::update::download::{DownloadRequest, DownloadSession, DownloadState, PackageDownloader, SessionHandle};
use crate::update::installer::{Installer, PackageKind, StagedInstall, StagedOrigin};
use crate::update::integrity;
use crate::update::registry::ReleaseSource;
use crate::version::{SemVer, VersionInfo};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Check,
    Download,
    Backup,
    Install,
}

impl FailureStage {
    /// Check and download failures can be retried from scratch. Backup and
    /// install failures need the user to look first.
    pub fn retry_safe(self) -> bool {
        matches!(self, FailureStage::Check | FailureStage::Download)
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureStage::Check => "check",
            FailureStage::Download => "download",
            FailureStage::Backup => "backup",
            FailureStage::Install => "install",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Checking,
    UpdateFound(VersionInfo),
    Downloading {
        info: VersionInfo,
        progress: DownloadSession,
    },
    Downloaded {
        info: VersionInfo,
        package: PathBuf,
        /// Digest the package was verified against while downloading.
        sha256: Option<String>,
    },
    BackingUp {
        version: SemVer,
    },
    Installing {
        version: SemVer,
    },
    /// The installer has taken over; the process should exit.
    Restarting {
        version: SemVer,
    },
    Failed {
        stage: FailureStage,
        reason: UpdateError,
    },
}

impl UpdateState {
    pub fn label(&self) -> &'static str {
        match self {
            UpdateState::Idle => "idle",
            UpdateState::Checking => "checking",
            UpdateState::UpdateFound(_) => "update found",
            UpdateState::Downloading { .. } => "downloading",
            UpdateState::Downloaded { .. } => "downloaded",
            UpdateState::BackingUp { .. } => "backing up",
            UpdateState::Installing { .. } => "installing",
            UpdateState::Restarting { .. } => "restarting",
            UpdateState::Failed { .. } => "failed",
        }
    }

    /// Once the backup has started, the attempt must run to completion or failure.
    pub fn is_cancellable(&self) -> bool {
        !matches!(
            self,
            UpdateState::BackingUp { .. }
                | UpdateState::Installing { .. }
                | UpdateState::Restarting { .. }
        )
    }
}

pub struct UpdateOrchestrator {
    source: Box<dyn ReleaseSource>,
    downloader: PackageDownloader,
    backups: BackupStore,
    installer: Arc<dyn Installer>,
    current_version: SemVer,
    current_exe: PathBuf,
    state: UpdateState,
    session: Option<SessionHandle>,
}

impl UpdateOrchestrator {
    pub fn new(
        source: Box<dyn ReleaseSource>,
        downloader: PackageDownloader,
        backups: BackupStore,
        installer: Arc<dyn Installer>,
        current_version: SemVer,
        current_exe: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            downloader,
            backups,
            installer,
            current_version,
            current_exe: current_exe.into(),
            state: UpdateState::Idle,
            session: None,
        }
    }

    pub fn state(&self) -> &UpdateState {
        &self.state
    }

    pub fn current_version(&self) -> &SemVer {
        &self.current_version
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Ask the registry for the latest release.
    ///
    /// Returns the release when it is strictly newer than the running version.
    /// A registry without a package for this platform counts as "no update".
    pub fn check(&mut self) -> Result<Option<VersionInfo>, UpdateError> {
        match self.state {
            UpdateState::Idle | UpdateState::UpdateFound(_) | UpdateState::Failed { .. } => {}
            _ => return Err(self.invalid("check for updates")),
        }
        self.transition(UpdateState::Checking);

        match self.source.check_latest() {
            Ok(info) if info.is_newer_than(&self.current_version) => {
                info!(current = %self.current_version, latest = %info.version, "update available");
                self.transition(UpdateState::UpdateFound(info.clone()));
                Ok(Some(info))
            }
            Ok(info) => {
                debug!(current = %self.current_version, latest = %info.version, "up to date");
                self.transition(UpdateState::Idle);
                Ok(None)
            }
            Err(UpdateError::NoCompatibleAsset { platform }) => {
                info!(%platform, "no release package for this platform");
                self.transition(UpdateState::Idle);
                Ok(None)
            }
            Err(e) => {
                self.fail(FailureStage::Check, e.clone());
                Err(e)
            }
        }
    }

    /// The user does not want the update that was found.
    pub fn decline(&mut self) -> Result<(), UpdateError> {
        match self.state {
            UpdateState::UpdateFound(_) => {
                self.transition(UpdateState::Idle);
                Ok(())
            }
            _ => Err(self.invalid("decline")),
        }
    }

    /// Start downloading the release found by [`check`](Self::check).
    pub fn start_download(&mut self) -> Result<SessionHandle, UpdateError> {
        let info = match &self.state {
            UpdateState::UpdateFound(info) => info.clone(),
            _ => return Err(self.invalid("download")),
        };

        let handle = match self.downloader.start(DownloadRequest::from(&info)) {
            Ok(handle) => handle,
            Err(UpdateError::AlreadyDownloading) => return Err(UpdateError::AlreadyDownloading),
            Err(e) => {
                self.fail(FailureStage::Download, e.clone());
                return Err(e);
            }
        };
        let progress = self.downloader.poll_status(handle)?;
        self.session = Some(handle);
        self.transition(UpdateState::Downloading { info, progress });
        Ok(handle)
    }

    /// Refresh download progress and return the current state. Never fails;
    /// a failed download shows up as `Failed { stage: Download, .. }`.
    pub fn poll(&mut self) -> &UpdateState {
        let UpdateState::Downloading { info, .. } = &self.state else {
            return &self.state;
        };
        let info = info.clone();

        let snapshot = match self.session {
            Some(handle) => self.downloader.poll_status(handle),
            None => Err(UpdateError::UnknownSession(0)),
        };
        match snapshot {
            Ok(progress) => match progress.state.clone() {
                DownloadState::Completed => self.transition(UpdateState::Downloaded {
                    info,
                    package: progress.destination,
                    sha256: progress.sha256,
                }),
                DownloadState::Failed(reason) => {
                    self.discard_download();
                    self.fail(FailureStage::Download, reason);
                }
                DownloadState::Idle | DownloadState::InProgress => {
                    self.state = UpdateState::Downloading { info, progress };
                }
            },
            Err(reason) => {
                self.session = None;
                self.fail(FailureStage::Download, reason);
            }
        }
        &self.state
    }

    /// Abandon the attempt. Allowed up to and including `Downloaded`; the
    /// staged package is deleted.
    pub fn cancel(&mut self) -> Result<(), UpdateError> {
        if !self.state.is_cancellable() {
            return Err(self.invalid("cancel"));
        }
        self.discard_download();
        self.transition(UpdateState::Idle);
        Ok(())
    }

    /// Verify the downloaded package, back up the running binary and hand
    /// off to the installer.
    ///
    /// On success the state is `Restarting` and the caller should exit so the
    /// installer can replace the binary. Returns the backup that was taken.
    pub fn install(&mut self) -> Result<Backup, UpdateError> {
        let (info, package, sha256) = match &self.state {
            UpdateState::Downloaded {
                info,
                package,
                sha256,
            } => (info.clone(), package.clone(), sha256.clone()),
            _ => return Err(self.invalid("install")),
        };

        let mut policy = self.downloader.integrity_policy();
        policy.sha256 = sha256;
        let staged = Staged::new(StagedInstall {
            package,
            version: info.version.clone(),
            kind: PackageKind::from_file_name(&info.package_name),
            origin: StagedOrigin::Download,
        });
        let verified = match staged.verify(|s| integrity::verify_package(&s.package, &policy)) {
            Ok(verified) => verified,
            Err(e) => {
                self.discard_download();
                self.fail(FailureStage::Download, e.clone());
                return Err(e);
            }
        };

        self.transition(UpdateState::BackingUp {
            version: self.current_version.clone(),
        });
        let backup = match self
            .backups
            .create_backup(&self.current_exe, &self.current_version)
        {
            Ok(backup) => backup,
            Err(e) => {
                self.discard_download();
                self.fail(FailureStage::Backup, e.clone());
                return Err(e);
            }
        };

        self.transition(UpdateState::Installing {
            version: info.version.clone(),
        });
        match verified.commit(self.installer.as_ref()) {
            Ok(staged) => {
                // The handoff process owns the package from here on.
                self.session = None;
                self.transition(UpdateState::Restarting {
                    version: staged.version,
                });
                Ok(backup)
            }
            Err(e) => {
                self.discard_download();
                self.fail(FailureStage::Install, e.clone());
                Err(e)
            }
        }
    }

    /// Reinstall the backed-up `version` through the same installer path.
    ///
    /// The running binary is backed up first unless it is the version being
    /// restored. A missing or damaged backup leaves the state untouched.
    pub fn rollback(&mut self, version: &SemVer) -> Result<(), UpdateError> {
        match self.state {
            UpdateState::Idle | UpdateState::UpdateFound(_) | UpdateState::Failed { .. } => {}
            _ => return Err(self.invalid("roll back")),
        }

        let staged = self.backups.restore(version)?;
        let verified = Staged::new(staged).verify(|s| {
            if s.package.is_file() {
                Ok(())
            } else {
                Err(UpdateError::BackupNotFound(s.version.to_string()))
            }
        })?;

        if *version != self.current_version {
            self.transition(UpdateState::BackingUp {
                version: self.current_version.clone(),
            });
            if let Err(e) = self
                .backups
                .create_backup(&self.current_exe, &self.current_version)
            {
                self.fail(FailureStage::Backup, e.clone());
                return Err(e);
            }
        }

        self.transition(UpdateState::Installing {
            version: version.clone(),
        });
        match verified.commit(self.installer.as_ref()) {
            Ok(_) => {
                self.transition(UpdateState::Restarting {
                    version: version.clone(),
                });
                Ok(())
            }
            Err(e) => {
                self.fail(FailureStage::Install, e.clone());
                Err(e)
            }
        }
    }

    fn discard_download(&mut self) {
        if let Some(handle) = self.session.take() {
            self.downloader.discard(handle);
        }
    }

    fn transition(&mut self, next: UpdateState) {
        info!(from = self.state.label(), to = next.label(), "update state");
        self.state = next;
    }

    fn fail(&mut self, stage: FailureStage, reason: UpdateError) {
        warn!(%stage, %reason, retry_safe = stage.retry_safe(), "update attempt failed");
        self.state = UpdateState::Failed { stage, reason };
    }

    fn invalid(&self, action: &'static str) -> UpdateError {
        UpdateError::InvalidTransition {
            action,
            state: self.state.label().to_string(),
        }
    }
}
