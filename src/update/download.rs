//! Package downloader.
//!
//! Streams a package into the staging directory on a worker thread while the
//! caller polls a mutex-guarded snapshot. Only one session may be in progress
//! at a time. A package is marked `Completed` only after it passes the
//! integrity check, which includes a SHA-256 comparison unless unverified
//! packages were explicitly allowed. Any failure deletes the partial file.

use crate::cancel::CancelToken;
use crate::config::UpdateSettings;
use crate::error::UpdateError;
use crate::update::integrity::{self, IntegrityPolicy, PackageFormat};
use crate::update::registry::{http_client, status_error};
use crate::version::VersionInfo;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const CHUNK_SIZE: usize = 64 * 1024;

/// What to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub file_name: String,
    /// Digest advertised by the registry.
    pub sha256: Option<String>,
    /// URL of a `sha256sum`-style digest, used when `sha256` is absent.
    pub checksum_url: Option<String>,
    /// Size advertised by the registry; checked when the server sends no `Content-Length`.
    pub expected_len: Option<u64>,
}

impl DownloadRequest {
    /// Request for `url`, naming the staged file after its last path segment.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let file_name = url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("package")
            .to_string();
        Self {
            url,
            file_name,
            sha256: None,
            checksum_url: None,
            expected_len: None,
        }
    }

    /// Verify the package against this lowercase hex SHA-256.
    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into());
        self
    }
}

impl From<&VersionInfo> for DownloadRequest {
    fn from(info: &VersionInfo) -> Self {
        Self {
            url: info.package_url.clone(),
            file_name: info.package_name.clone(),
            sha256: info.sha256.clone(),
            checksum_url: info.checksum_url.clone(),
            expected_len: info.package_size,
        }
    }
}

/// Lifecycle of a download session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    Idle,
    InProgress,
    Completed,
    Failed(UpdateError),
}

/// Snapshot of a download, safe to hand out while the worker keeps writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSession {
    pub id: u64,
    pub package_url: String,
    /// Final location of the verified package.
    pub destination: PathBuf,
    /// From `Content-Length`; `None` degrades progress to a byte count.
    pub bytes_total: Option<u64>,
    pub bytes_downloaded: u64,
    pub state: DownloadState,
    /// Digest the completed package was verified against.
    pub sha256: Option<String>,
}

impl DownloadSession {
    /// Percentage done, or `None` when the total size is unknown.
    pub fn percent(&self) -> Option<f64> {
        self.bytes_total.map(|total| {
            if total == 0 {
                100.0
            } else {
                self.bytes_downloaded as f64 * 100.0 / total as f64
            }
        })
    }
}

/// Opaque reference to a download session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

struct ActiveSession {
    handle: SessionHandle,
    status: Arc<Mutex<DownloadSession>>,
    cancel: CancelToken,
    worker: Option<JoinHandle<()>>,
}

/// Streams release packages into a staging directory, one session at a time.
pub struct PackageDownloader {
    http: reqwest::blocking::Client,
    staging_dir: PathBuf,
    format: PackageFormat,
    min_bytes: u64,
    allow_unverified: bool,
    stall_timeout: Duration,
    next_id: AtomicU64,
    current: Mutex<Option<ActiveSession>>,
}

impl PackageDownloader {
    /// Create a downloader staging into `staging_dir`, which must live outside
    /// the installation directory.
    pub fn new(staging_dir: impl Into<PathBuf>, settings: &UpdateSettings) -> Result<Self, UpdateError> {
        let stall_timeout = Duration::from_secs(settings.stall_timeout_secs.max(1));
        Ok(Self {
            http: http_client(stall_timeout)?,
            staging_dir: staging_dir.into(),
            format: PackageFormat::for_current_platform(),
            min_bytes: settings.min_package_bytes,
            allow_unverified: settings.allow_unverified,
            stall_timeout,
            next_id: AtomicU64::new(1),
            current: Mutex::new(None),
        })
    }

    /// Expect packages in `format` instead of the running platform's.
    pub fn with_format(mut self, format: PackageFormat) -> Self {
        self.format = format;
        self
    }

    /// Structural checks every staged package must pass.
    pub fn integrity_policy(&self) -> IntegrityPolicy {
        IntegrityPolicy::new(self.format, self.min_bytes)
    }

    /// Begin downloading `request` in the background.
    pub fn start(&self, request: DownloadRequest) -> Result<SessionHandle, UpdateError> {
        let mut current = self.lock();
        if let Some(active) = current.as_ref() {
            if lock_status(&active.status).state == DownloadState::InProgress {
                return Err(UpdateError::AlreadyDownloading);
            }
        }
        if let Some(previous) = current.take() {
            remove_if_exists(&lock_status(&previous.status).destination);
        }

        fs::create_dir_all(&self.staging_dir)
            .map_err(|e| UpdateError::io(&self.staging_dir, e))?;

        let file_name = Path::new(&request.file_name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "package".to_string());
        let destination = self.staging_dir.join(&file_name);
        let partial = self.staging_dir.join(format!("{}.part", file_name));

        let handle = SessionHandle(self.next_id.fetch_add(1, Ordering::SeqCst));
        let status = Arc::new(Mutex::new(DownloadSession {
            id: handle.0,
            package_url: request.url.clone(),
            destination: destination.clone(),
            bytes_total: None,
            bytes_downloaded: 0,
            state: DownloadState::InProgress,
            sha256: None,
        }));
        let cancel = CancelToken::new();

        let job = DownloadJob {
            http: self.http.clone(),
            request,
            partial,
            destination,
            policy: self.integrity_policy(),
            allow_unverified: self.allow_unverified,
            stall_secs: self.stall_timeout.as_secs(),
            status: Arc::clone(&status),
            cancel: cancel.clone(),
        };
        info!(session = handle.0, url = %job.request.url, "download started");
        let worker = thread::Builder::new()
            .name("memdoc-download".to_string())
            .spawn(move || job.run())
            .map_err(|e| UpdateError::io(&self.staging_dir, e))?;

        *current = Some(ActiveSession {
            handle,
            status,
            cancel,
            worker: Some(worker),
        });
        Ok(handle)
    }

    /// Current snapshot of `handle`. Never blocks on the transfer.
    pub fn poll_status(&self, handle: SessionHandle) -> Result<DownloadSession, UpdateError> {
        let current = self.lock();
        match current.as_ref() {
            Some(active) if active.handle == handle => Ok(lock_status(&active.status).clone()),
            _ => Err(UpdateError::UnknownSession(handle.0)),
        }
    }

    /// Ask the worker to stop at the next chunk boundary.
    pub fn cancel(&self, handle: SessionHandle) -> Result<(), UpdateError> {
        let current = self.lock();
        match current.as_ref() {
            Some(active) if active.handle == handle => {
                active.cancel.cancel();
                Ok(())
            }
            _ => Err(UpdateError::UnknownSession(handle.0)),
        }
    }

    /// Block until the worker for `handle` finishes, then return its final snapshot.
    pub fn wait(&self, handle: SessionHandle) -> Result<DownloadSession, UpdateError> {
        let worker = {
            let mut current = self.lock();
            match current.as_mut() {
                Some(active) if active.handle == handle => active.worker.take(),
                _ => return Err(UpdateError::UnknownSession(handle.0)),
            }
        };
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!(session = handle.0, "download worker panicked");
            }
        }
        self.poll_status(handle)
    }

    /// Cancel if needed, wait, delete the package and forget the session.
    pub fn discard(&self, handle: SessionHandle) {
        if self.cancel(handle).is_err() {
            return;
        }
        let _ = self.wait(handle);
        let mut current = self.lock();
        if let Some(active) = current.take() {
            remove_if_exists(&lock_status(&active.status).destination);
            debug!(session = handle.0, "download discarded");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_status(status: &Mutex<DownloadSession>) -> MutexGuard<'_, DownloadSession> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove_if_exists(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed staged package"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove staged package"),
    }
}

struct DownloadJob {
    http: reqwest::blocking::Client,
    request: DownloadRequest,
    partial: PathBuf,
    destination: PathBuf,
    policy: IntegrityPolicy,
    allow_unverified: bool,
    stall_secs: u64,
    status: Arc<Mutex<DownloadSession>>,
    cancel: CancelToken,
}

impl DownloadJob {
    fn run(mut self) {
        let result = self.transfer();
        let mut status = lock_status(&self.status);
        match result {
            Ok(()) => {
                info!(session = status.id, bytes = status.bytes_downloaded, "download verified");
                status.sha256 = self.policy.sha256.take();
                status.state = DownloadState::Completed;
            }
            Err(e) => {
                remove_if_exists(&self.partial);
                remove_if_exists(&self.destination);
                warn!(session = status.id, error = %e, "download failed");
                status.state = DownloadState::Failed(e);
            }
        }
    }

    fn transfer(&mut self) -> Result<(), UpdateError> {
        self.policy.sha256 = self.resolve_digest()?;

        let mut response = self
            .http
            .get(&self.request.url)
            .send()
            .map_err(|e| self.transport_error(e.is_timeout(), e))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), &self.request.url));
        }

        let total = response.content_length();
        self.policy.expected_len = total.or(self.request.expected_len);
        lock_status(&self.status).bytes_total = total;

        let file = File::create(&self.partial).map_err(|e| UpdateError::io(&self.partial, e))?;
        let mut writer = BufWriter::new(file);
        let mut buf = vec![0u8; CHUNK_SIZE];

        loop {
            if self.cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            let n = match response.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    let timed_out = e.kind() == ErrorKind::TimedOut
                        || e.to_string().contains("timed out");
                    return Err(self.transport_error(timed_out, e));
                }
            };
            writer
                .write_all(&buf[..n])
                .map_err(|e| UpdateError::io(&self.partial, e))?;
            lock_status(&self.status).bytes_downloaded += n as u64;
        }

        let file = writer
            .into_inner()
            .map_err(|e| UpdateError::io(&self.partial, e.into_error()))?;
        file.sync_all()
            .map_err(|e| UpdateError::io(&self.partial, e))?;
        drop(file);

        integrity::verify_package(&self.partial, &self.policy)?;
        fs::rename(&self.partial, &self.destination)
            .map_err(|e| UpdateError::io(&self.destination, e))
    }

    /// Registry digest first, then the published checksum file.
    fn resolve_digest(&self) -> Result<Option<String>, UpdateError> {
        if let Some(digest) = &self.request.sha256 {
            return Ok(Some(digest.to_ascii_lowercase()));
        }
        if let Some(url) = &self.request.checksum_url {
            return self.fetch_checksum(url).map(Some);
        }
        if self.allow_unverified {
            warn!(url = %self.request.url, "no published digest, verifying structure only");
            return Ok(None);
        }
        Err(UpdateError::Unverifiable(format!(
            "no SHA-256 digest published for {}",
            self.request.file_name
        )))
    }

    fn fetch_checksum(&self, url: &str) -> Result<String, UpdateError> {
        let response = self
            .http
            .get(url)
            .send()
            .map_err(|e| self.transport_error(e.is_timeout(), e))?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), url));
        }
        let text = response
            .text()
            .map_err(|e| self.transport_error(e.is_timeout(), e))?;
        integrity::parse_checksum(&text)
            .ok_or_else(|| UpdateError::InvalidDescriptor(format!("unreadable checksum at {}", url)))
    }

    fn transport_error(&self, timed_out: bool, err: impl std::fmt::Display) -> UpdateError {
        if timed_out {
            UpdateError::Stalled {
                secs: self.stall_secs,
            }
        } else {
            UpdateError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{elf_package, sha256_hex, PackageServer, Route};
    use tempfile::TempDir;

    fn settings() -> UpdateSettings {
        UpdateSettings {
            min_package_bytes: 1024,
            ..UpdateSettings::default()
        }
    }

    fn downloader(staging: &Path) -> PackageDownloader {
        PackageDownloader::new(staging, &settings())
            .unwrap()
            .with_format(PackageFormat::Elf)
    }

    fn permissive_downloader(staging: &Path) -> PackageDownloader {
        let settings = UpdateSettings {
            allow_unverified: true,
            ..settings()
        };
        PackageDownloader::new(staging, &settings)
            .unwrap()
            .with_format(PackageFormat::Elf)
    }

    /// Serve `body` at `path` and build a request carrying its digest.
    fn published(server: &PackageServer, path: &str, route: Route) -> DownloadRequest {
        let digest = sha256_hex(&route.body);
        server.route(path, route);
        DownloadRequest::new(server.url(path)).with_sha256(digest)
    }

    #[test]
    fn test_download_completes_and_verifies() {
        let temp = TempDir::new().unwrap();
        let server = PackageServer::start();
        let body = elf_package(200_000);
        let digest = sha256_hex(&body);
        let request = published(&server, "/memdoc-linux-x86_64", Route::ok(body));

        let dl = downloader(temp.path());
        let handle = dl.start(request).unwrap();
        let session = dl.wait(handle).unwrap();

        assert_eq!(session.state, DownloadState::Completed);
        assert_eq!(session.bytes_total, Some(200_000));
        assert_eq!(session.bytes_downloaded, 200_000);
        assert_eq!(session.percent(), Some(100.0));
        assert_eq!(session.sha256, Some(digest));
        assert_eq!(session.destination, temp.path().join("memdoc-linux-x86_64"));
        assert!(session.destination.exists());
        assert!(!temp.path().join("memdoc-linux-x86_64.part").exists());
    }

    #[test]
    fn test_missing_content_length_reports_bytes_only() {
        let temp = TempDir::new().unwrap();
        let server = PackageServer::start();
        let request = published(&server, "/pkg", Route::ok(elf_package(50_000)).chunked());

        let dl = downloader(temp.path());
        let handle = dl.start(request).unwrap();
        let session = dl.wait(handle).unwrap();

        assert_eq!(session.state, DownloadState::Completed);
        assert_eq!(session.bytes_total, None);
        assert_eq!(session.percent(), None);
        assert_eq!(session.bytes_downloaded, 50_000);
    }

    #[test]
    fn test_corrupt_header_fails_and_deletes() {
        let temp = TempDir::new().unwrap();
        let server = PackageServer::start();
        let mut bytes = elf_package(4096);
        bytes[0] = 0;
        let request = published(&server, "/pkg", Route::ok(bytes));

        let dl = downloader(temp.path());
        let handle = dl.start(request).unwrap();
        let session = dl.wait(handle).unwrap();

        assert!(matches!(
            session.state,
            DownloadState::Failed(UpdateError::CorruptPackage(_))
        ));
        assert!(!session.destination.exists());
        assert!(!temp.path().join("pkg.part").exists());
    }

    #[test]
    fn test_one_flipped_byte_fails_with_checksum_file() {
        let temp = TempDir::new().unwrap();
        let server = PackageServer::start();
        let good = elf_package(8192);
        let digest = sha256_hex(&good);

        let mut corrupted = good;
        corrupted[5000] ^= 0xff;
        server.serve("/pkg", corrupted);
        server.serve("/pkg.sha256", format!("{}  pkg\n", digest).into_bytes());

        let dl = downloader(temp.path());
        let mut request = DownloadRequest::new(server.url("/pkg"));
        request.checksum_url = Some(server.url("/pkg.sha256"));
        let handle = dl.start(request).unwrap();

        let session = dl.wait(handle).unwrap();
        assert!(matches!(
            session.state,
            DownloadState::Failed(UpdateError::CorruptPackage(_))
        ));
    }

    #[test]
    fn test_one_flipped_byte_fails_with_registry_digest() {
        let temp = TempDir::new().unwrap();
        let server = PackageServer::start();
        let good = elf_package(8192);
        let digest = sha256_hex(&good);

        let mut corrupted = good;
        corrupted[5000] ^= 0xff;
        server.serve("/pkg", corrupted);

        let dl = downloader(temp.path());
        let handle = dl
            .start(DownloadRequest::new(server.url("/pkg")).with_sha256(digest))
            .unwrap();
        let session = dl.wait(handle).unwrap();

        match session.state {
            DownloadState::Failed(UpdateError::CorruptPackage(reason)) => {
                assert!(reason.contains("checksum mismatch"), "{}", reason)
            }
            other => panic!("expected a corrupt package, got {:?}", other),
        }
        assert!(!session.destination.exists());
    }

    #[test]
    fn test_release_without_digest_is_unverifiable() {
        let temp = TempDir::new().unwrap();
        let server = PackageServer::start();
        let mut bytes = elf_package(8192);
        bytes[5000] ^= 0xff;
        server.serve("/pkg", bytes);

        let dl = downloader(temp.path());
        let handle = dl.start(DownloadRequest::new(server.url("/pkg"))).unwrap();
        let session = dl.wait(handle).unwrap();

        assert!(matches!(
            session.state,
            DownloadState::Failed(UpdateError::Unverifiable(_))
        ));
        assert!(!session.destination.exists());
        assert_eq!(server.hits("/pkg"), 0);
    }

    #[test]
    fn test_unverified_packages_allowed_when_configured() {
        let temp = TempDir::new().unwrap();
        let server = PackageServer::start();
        server.serve("/pkg", elf_package(4096));

        let dl = permissive_downloader(temp.path());
        let handle = dl.start(DownloadRequest::new(server.url("/pkg"))).unwrap();
        let session = dl.wait(handle).unwrap();

        assert_eq!(session.state, DownloadState::Completed);
        assert_eq!(session.sha256, None);
    }

    #[test]
    fn test_advertised_size_catches_truncation_without_content_length() {
        let temp = TempDir::new().unwrap();
        let server = PackageServer::start();
        server.route("/pkg", Route::ok(elf_package(4096)).chunked());

        let dl = permissive_downloader(temp.path());
        let mut request = DownloadRequest::new(server.url("/pkg"));
        request.expected_len = Some(8192);
        let handle = dl.start(request).unwrap();
        let session = dl.wait(handle).unwrap();

        match session.state {
            DownloadState::Failed(UpdateError::CorruptPackage(reason)) => {
                assert!(reason.contains("truncated"), "{}", reason)
            }
            other => panic!("expected a truncated package, got {:?}", other),
        }
    }

    #[test]
    fn test_stalled_transfer_times_out() {
        let temp = TempDir::new().unwrap();
        let server = PackageServer::start();
        let request = published(
            &server,
            "/stuck",
            Route::slow(elf_package(16 * 1024), Duration::from_millis(2500)),
        );

        let settings = UpdateSettings {
            stall_timeout_secs: 1,
            ..settings()
        };
        let dl = PackageDownloader::new(temp.path(), &settings)
            .unwrap()
            .with_format(PackageFormat::Elf);
        let handle = dl.start(request).unwrap();
        let session = dl.wait(handle).unwrap();

        assert_eq!(
            session.state,
            DownloadState::Failed(UpdateError::Stalled { secs: 1 })
        );
        assert!(!temp.path().join("stuck.part").exists());
    }

    #[test]
    fn test_second_download_rejected_while_in_progress() {
        let temp = TempDir::new().unwrap();
        let server = PackageServer::start();
        let slow = published(
            &server,
            "/slow",
            Route::slow(elf_package(64 * 1024), Duration::from_millis(50)),
        );
        let other = published(&server, "/other", Route::ok(elf_package(4096)));

        let dl = downloader(temp.path());
        let first = dl.start(slow).unwrap();
        assert_eq!(
            dl.start(other.clone()),
            Err(UpdateError::AlreadyDownloading)
        );

        dl.cancel(first).unwrap();
        let session = dl.wait(first).unwrap();
        assert_eq!(session.state, DownloadState::Failed(UpdateError::Cancelled));
        assert!(!temp.path().join("slow.part").exists());

        let second = dl.start(other).unwrap();
        assert_eq!(dl.wait(second).unwrap().state, DownloadState::Completed);
    }

    #[test]
    fn test_poll_reports_progress_without_blocking() {
        let temp = TempDir::new().unwrap();
        let server = PackageServer::start();
        let request = published(
            &server,
            "/slow",
            Route::slow(elf_package(32 * 1024), Duration::from_millis(20)),
        );

        let dl = downloader(temp.path());
        let handle = dl.start(request).unwrap();
        let first = dl.poll_status(handle).unwrap();
        assert!(first.bytes_downloaded <= 32 * 1024);

        let done = dl.wait(handle).unwrap();
        assert_eq!(done.state, DownloadState::Completed);
        assert!(done.bytes_downloaded >= first.bytes_downloaded);
    }

    #[test]
    fn test_missing_package_fails() {
        let temp = TempDir::new().unwrap();
        let server = PackageServer::start();
        let dl = downloader(temp.path());
        let request = DownloadRequest::new(server.url("/gone")).with_sha256("0".repeat(64));
        let handle = dl.start(request).unwrap();
        let session = dl.wait(handle).unwrap();
        assert!(matches!(
            session.state,
            DownloadState::Failed(UpdateError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_unknown_handle() {
        let temp = TempDir::new().unwrap();
        let dl = downloader(temp.path());
        assert_eq!(
            dl.poll_status(SessionHandle(99)),
            Err(UpdateError::UnknownSession(99))
        );
    }

    #[test]
    fn test_discard_removes_completed_package() {
        let temp = TempDir::new().unwrap();
        let server = PackageServer::start();
        let request = published(&server, "/pkg", Route::ok(elf_package(4096)));

        let dl = downloader(temp.path());
        let handle = dl.start(request).unwrap();
        let session = dl.wait(handle).unwrap();
        assert!(session.destination.exists());

        dl.discard(handle);
        assert!(!session.destination.exists());
        assert!(dl.poll_status(handle).is_err());
    }

    #[test]
    fn test_request_from_release_carries_digest_and_size() {
        let info = VersionInfo {
            version: crate::version::SemVer::new(1, 4, 0),
            release_date: None,
            release_notes: String::new(),
            package_url: "http://h/a/memdoc-linux-x86_64".to_string(),
            package_name: "memdoc-linux-x86_64".to_string(),
            package_size: Some(8192),
            sha256: Some("a".repeat(64)),
            checksum_url: None,
        };
        let request = DownloadRequest::from(&info);
        assert_eq!(request.expected_len, Some(8192));
        assert_eq!(request.sha256, Some("a".repeat(64)));
    }

    #[test]
    fn test_request_file_name_from_url() {
        assert_eq!(DownloadRequest::new("http://h/a/MemDoc.exe").file_name, "MemDoc.exe");
        assert_eq!(DownloadRequest::new("http://h/a/").file_name, "package");
    }
}
