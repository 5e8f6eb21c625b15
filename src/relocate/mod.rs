//! Data directory relocation.
//!
//! A migration copies the whole active data tree to a new directory, verifies
//! the copy, and only then flips the active data pointer in the config. The
//! source is never deleted, and an aborted job leaves the partial destination
//! in place for inspection. At most one migration runs at a time.

pub mod estimate;
pub mod validate;
pub mod verify;

pub use estimate::{estimate_migration, MigrationEstimate};
pub use validate::{validate_destination, ValidateOptions};
pub use verify::{dir_stats, TreeStats};

use crate::cancel::{CancelToken, JobGuard};
use crate::commit::{CommitPointer, Staged};
use crate::config::{ConfigError, ConfigStore};
use crate::error::{MigrationError, ValidationError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Files compared by content hash during verification.
const SAMPLE_SIZE: usize = 16;

/// Copies a single file. The seam for fault injection in tests.
pub trait FileCopier: Send + Sync {
    /// Copy `from` to `to`, returning the number of bytes written.
    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64>;
}

pub struct FsCopier;

impl FileCopier for FsCopier {
    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64> {
        fs::copy(from, to)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationState {
    Validating,
    Copying,
    Verifying,
    Committed,
    Aborted(MigrationError),
}

/// Snapshot of a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationJob {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub state: MigrationState,
    pub files_copied: u64,
    pub total_files: u64,
}

impl MigrationJob {
    fn new(source: PathBuf, destination: PathBuf) -> Self {
        Self {
            source,
            destination,
            state: MigrationState::Validating,
            files_copied: 0,
            total_files: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            MigrationState::Committed | MigrationState::Aborted(_)
        )
    }
}

/// A copied and verified data tree, ready to become the active one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocatedTree {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub files: u64,
}

impl CommitPointer<RelocatedTree> for ConfigStore {
    type Error = ConfigError;

    fn flip(&self, tree: &RelocatedTree) -> Result<(), ConfigError> {
        self.commit_data_dir(&tree.destination, tree.files)
    }
}

pub struct DataRelocator {
    config: Arc<ConfigStore>,
    copier: Box<dyn FileCopier>,
    busy: Arc<AtomicBool>,
}

impl DataRelocator {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            config,
            copier: Box::new(FsCopier),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_copier(mut self, copier: impl FileCopier + 'static) -> Self {
        self.copier = Box::new(copier);
        self
    }

    /// Check `destination` against the current active data directory.
    pub fn validate(
        &self,
        destination: &Path,
        options: ValidateOptions,
    ) -> Result<(), ValidationError> {
        validate_destination(&self.config.active_data().path, destination, options)
    }

    /// Rough duration of a migration to `destination`, from the size of the
    /// active data directory.
    pub fn estimate(&self, destination: &Path) -> io::Result<MigrationEstimate> {
        estimate_migration(&self.config.active_data().path, destination)
    }

    /// Run a migration on the calling thread, reporting progress after each
    /// state change and each copied file.
    pub fn migrate(
        &self,
        destination: &Path,
        options: ValidateOptions,
        mut progress: impl FnMut(&MigrationJob),
    ) -> Result<MigrationJob, MigrationError> {
        let guard = JobGuard::try_claim(&self.busy).ok_or(MigrationError::AlreadyInProgress)?;
        self.run(guard, destination, options, &CancelToken::new(), &mut progress)
    }

    /// Run a migration on a worker thread. The job slot is claimed before
    /// this returns, so a concurrent call fails immediately.
    pub fn spawn_migration(
        self: &Arc<Self>,
        destination: impl Into<PathBuf>,
        options: ValidateOptions,
    ) -> Result<MigrationHandle, MigrationError> {
        let guard = JobGuard::try_claim(&self.busy).ok_or(MigrationError::AlreadyInProgress)?;
        let destination = destination.into();
        let status = Arc::new(Mutex::new(MigrationJob::new(
            self.config.active_data().path,
            destination.clone(),
        )));
        let cancel = CancelToken::new();

        let relocator = Arc::clone(self);
        let worker_status = Arc::clone(&status);
        let worker_cancel = cancel.clone();
        let worker = thread::Builder::new()
            .name("memdoc-migrate".to_string())
            .spawn(move || {
                let mut publish = |job: &MigrationJob| {
                    *worker_status.lock().unwrap_or_else(PoisonError::into_inner) = job.clone();
                };
                let _ = relocator.run(guard, &destination, options, &worker_cancel, &mut publish);
            })
            .map_err(|e| MigrationError::io(Path::new("migration worker"), e))?;

        Ok(MigrationHandle {
            status,
            cancel,
            worker: Some(worker),
        })
    }

    fn run(
        &self,
        _guard: JobGuard,
        destination: &Path,
        options: ValidateOptions,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(&MigrationJob),
    ) -> Result<MigrationJob, MigrationError> {
        let source = self.config.active_data().path;
        let mut job = MigrationJob::new(source, destination.to_path_buf());
        info!(
            source = %job.source.display(),
            destination = %job.destination.display(),
            "migration started"
        );
        progress(&job);

        match self.run_stages(&mut job, options, cancel, progress) {
            Ok(()) => {
                info!(
                    destination = %job.destination.display(),
                    files = job.files_copied,
                    "migration committed"
                );
                Ok(job)
            }
            Err(e) => {
                warn!(
                    stage = %e.stage(),
                    error = %e,
                    files_copied = job.files_copied,
                    "migration aborted, active data directory unchanged"
                );
                job.state = MigrationState::Aborted(e.clone());
                progress(&job);
                Err(e)
            }
        }
    }

    fn run_stages(
        &self,
        job: &mut MigrationJob,
        options: ValidateOptions,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(&MigrationJob),
    ) -> Result<(), MigrationError> {
        validate_destination(&job.source, &job.destination, options)?;

        job.state = MigrationState::Copying;
        progress(job);
        self.copy_tree(job, cancel, progress)?;

        job.state = MigrationState::Verifying;
        progress(job);
        let staged = Staged::new(RelocatedTree {
            source: job.source.clone(),
            destination: job.destination.clone(),
            files: job.files_copied,
        });
        let verified = staged.verify(|tree| {
            verify::verify_tree(
                &tree.source,
                &tree.destination,
                SAMPLE_SIZE,
                options.allow_non_empty,
            )
            .map(|_| ())
        })?;

        if cancel.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }
        verified
            .commit(self.config.as_ref())
            .map_err(|e| MigrationError::Commit(e.to_string()))?;

        job.state = MigrationState::Committed;
        progress(job);
        Ok(())
    }

    fn copy_tree(
        &self,
        job: &mut MigrationJob,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(&MigrationJob),
    ) -> Result<(), MigrationError> {
        let entries: Vec<walkdir::DirEntry> = WalkDir::new(&job.source)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .collect::<Result<_, _>>()
            .map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| job.source.clone());
                MigrationError::io(&path, e)
            })?;
        job.total_files = entries.iter().filter(|e| e.file_type().is_file()).count() as u64;
        progress(job);

        fs::create_dir_all(&job.destination)
            .map_err(|e| MigrationError::io(&job.destination, e))?;

        for entry in entries {
            let Ok(relative) = entry.path().strip_prefix(&job.source) else {
                continue;
            };
            let target = job.destination.join(relative);

            if entry.file_type().is_dir() {
                fs::create_dir_all(&target).map_err(|e| MigrationError::io(&target, e))?;
                continue;
            }
            if !entry.file_type().is_file() {
                debug!(path = %entry.path().display(), "skipping special file");
                continue;
            }

            if cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }
            self.copier
                .copy_file(entry.path(), &target)
                .map_err(|e| MigrationError::io(entry.path(), e))?;
            job.files_copied += 1;
            progress(job);
        }
        Ok(())
    }
}

/// A migration running on a worker thread.
pub struct MigrationHandle {
    status: Arc<Mutex<MigrationJob>>,
    cancel: CancelToken,
    worker: Option<JoinHandle<()>>,
}

impl MigrationHandle {
    /// Latest snapshot. Never blocks on the copy.
    pub fn status(&self) -> MigrationJob {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop after the file currently being copied.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Block until the job finishes and return its final snapshot.
    pub fn wait(mut self) -> MigrationJob {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("migration worker panicked");
            }
        }
        self.status()
    }
}
