//! Shared fixtures for unit tests.

use crate::error::UpdateError;
use crate::relocate::FileCopier;
use crate::update::installer::{Installer, StagedInstall};
use crate::update::registry::ReleaseSource;
use crate::version::{SemVer, VersionInfo};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tiny_http::{Response, Server, StatusCode};

/// A canned HTTP response.
#[derive(Clone)]
pub struct Route {
    pub status: u16,
    pub body: Vec<u8>,
    /// Delay between 4 KiB chunks, for in-flight cancellation tests.
    pub chunk_delay: Option<Duration>,
    /// Send the body with chunked transfer encoding and no `Content-Length`.
    pub chunked: bool,
}

impl Route {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            body,
            chunk_delay: None,
            chunked: false,
        }
    }

    pub fn slow(body: Vec<u8>, chunk_delay: Duration) -> Self {
        Self {
            chunk_delay: Some(chunk_delay),
            ..Self::ok(body)
        }
    }

    pub fn chunked(mut self) -> Self {
        self.chunked = true;
        self
    }

    // tiny_http switches to chunked encoding from 32 KiB by default.
    fn chunked_threshold(&self) -> usize {
        if self.chunked {
            0
        } else {
            usize::MAX
        }
    }
}

/// Local registry/package server on 127.0.0.1 with an ephemeral port.
pub struct PackageServer {
    addr: SocketAddr,
    server: Arc<Server>,
    routes: Arc<Mutex<HashMap<String, Route>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    worker: Option<JoinHandle<()>>,
}

impl PackageServer {
    pub fn start() -> Self {
        let server = Arc::new(Server::http("127.0.0.1:0").unwrap());
        let addr = server.server_addr().to_ip().unwrap();
        let routes: Arc<Mutex<HashMap<String, Route>>> = Arc::default();
        let hits: Arc<Mutex<HashMap<String, usize>>> = Arc::default();

        let worker = {
            let server = Arc::clone(&server);
            let routes = Arc::clone(&routes);
            let hits = Arc::clone(&hits);
            thread::spawn(move || {
                for request in server.incoming_requests() {
                    let path = request.url().to_string();
                    *hits.lock().unwrap().entry(path.clone()).or_default() += 1;
                    let route = routes.lock().unwrap().get(&path).cloned();
                    thread::spawn(move || {
                        let _ = match route {
                            None => request.respond(
                                Response::from_string("not found").with_status_code(StatusCode(404)),
                            ),
                            Some(route) => {
                                let threshold = route.chunked_threshold();
                                match route.chunk_delay {
                                    None => request.respond(
                                        Response::from_data(route.body)
                                            .with_status_code(StatusCode(route.status))
                                            .with_chunked_threshold(threshold),
                                    ),
                                    Some(delay) => {
                                        let len = route.body.len();
                                        let reader = SlowReader {
                                            data: route.body,
                                            pos: 0,
                                            delay,
                                        };
                                        request.respond(
                                            Response::new(
                                                StatusCode(route.status),
                                                vec![],
                                                reader,
                                                Some(len),
                                                None,
                                            )
                                            .with_chunked_threshold(threshold),
                                        )
                                    }
                                }
                            }
                        };
                    });
                }
            })
        };

        Self {
            addr,
            server,
            routes,
            hits,
            worker: Some(worker),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn serve(&self, path: &str, body: Vec<u8>) {
        self.route(path, Route::ok(body));
    }

    pub fn route(&self, path: &str, route: Route) {
        self.routes.lock().unwrap().insert(path.to_string(), route);
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

impl Drop for PackageServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct SlowReader {
    data: Vec<u8>,
    pos: usize,
    delay: Duration,
}

impl Read for SlowReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.data.len() {
            return Ok(0);
        }
        thread::sleep(self.delay);
        let n = buf.len().min(4096).min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Bytes that pass the ELF header check.
pub fn elf_package(len: usize) -> Vec<u8> {
    let mut bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    bytes[..4].copy_from_slice(b"\x7fELF");
    bytes
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Release source returning a fixed answer.
pub struct FixedRelease(pub Result<VersionInfo, UpdateError>);

impl FixedRelease {
    /// A release that advertises no digest or size.
    pub fn version(version: &str, package_url: String) -> Self {
        FixedRelease(Ok(VersionInfo {
            version: SemVer::parse(version).unwrap(),
            release_date: None,
            release_notes: String::new(),
            package_url,
            package_name: "memdoc-linux-x86_64".to_string(),
            package_size: None,
            sha256: None,
            checksum_url: None,
        }))
    }

    /// A release advertising the size and digest of `published`.
    pub fn package(version: &str, package_url: String, published: &[u8]) -> Self {
        let mut release = Self::version(version, package_url);
        if let Ok(info) = release.0.as_mut() {
            info.package_size = Some(published.len() as u64);
            info.sha256 = Some(sha256_hex(published));
        }
        release
    }
}

impl ReleaseSource for FixedRelease {
    fn check_latest(&self) -> Result<VersionInfo, UpdateError> {
        self.0.clone()
    }
}

/// Installer that records handoffs instead of launching anything.
#[derive(Default)]
pub struct RecordingInstaller {
    pub handoffs: Mutex<Vec<StagedInstall>>,
    pub fail_with: Option<String>,
}

impl RecordingInstaller {
    pub fn failing(reason: &str) -> Self {
        Self {
            handoffs: Mutex::default(),
            fail_with: Some(reason.to_string()),
        }
    }

    pub fn staged(&self) -> Vec<StagedInstall> {
        self.handoffs.lock().unwrap().clone()
    }
}

impl Installer for RecordingInstaller {
    fn hand_off(&self, staged: &StagedInstall) -> Result<(), UpdateError> {
        if let Some(reason) = &self.fail_with {
            return Err(UpdateError::InstallHandoff(reason.clone()));
        }
        self.handoffs.lock().unwrap().push(staged.clone());
        Ok(())
    }
}

/// Copier that fails on the n-th file (1-based).
pub struct FailingCopier {
    pub fail_on: usize,
    calls: AtomicUsize,
}

impl FailingCopier {
    pub fn new(fail_on: usize) -> Self {
        Self {
            fail_on,
            calls: AtomicUsize::new(0),
        }
    }
}

impl FileCopier for FailingCopier {
    fn copy_file(&self, from: &Path, to: &Path) -> std::io::Result<u64> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated disk failure",
            ));
        }
        std::fs::copy(from, to)
    }
}

/// Write `count` small files under `root`, spread over a nested layout.
pub fn populate_tree(root: &Path, count: usize) {
    std::fs::create_dir_all(root.join("chapters")).unwrap();
    std::fs::create_dir_all(root.join("images")).unwrap();
    std::fs::write(root.join("memoir.json"), b"{\"title\":\"My Life\"}").unwrap();
    for i in 1..count {
        let dir = if i % 2 == 0 { "chapters" } else { "images" };
        std::fs::write(
            root.join(dir).join(format!("file-{:02}.md", i)),
            format!("# Chapter {}\n{}", i, "text ".repeat(i * 10)),
        )
        .unwrap();
    }
}
