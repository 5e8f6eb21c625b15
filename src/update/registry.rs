//! Release registry client.
//!
//! Queries a GitHub-Releases-shaped index and picks the highest release that
//! ships a package for this platform. Transient network failures are retried
//! with bounded exponential backoff; everything else is returned at once.

use crate::config::{RetrySettings, UpdateSettings};
use crate::error::UpdateError;
use crate::update::integrity;
use crate::version::{SemVer, VersionInfo, CURRENT_VERSION};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Anything that can answer "what is the latest release?".
pub trait ReleaseSource: Send + Sync {
    fn check_latest(&self) -> Result<VersionInfo, UpdateError>;
}

/// OS/architecture pair used to pick release assets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    pub fn current() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Whether a release asset named `name` installs on this platform.
    pub fn matches_asset(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        if name.contains("TEST") || lower.ends_with(".sha256") {
            return false;
        }
        match self.os.as_str() {
            "windows" => lower.ends_with(".exe"),
            "macos" => {
                (lower.contains("macos") || lower.contains("darwin"))
                    && (lower.contains(&self.arch) || lower.contains("universal"))
            }
            os => lower.contains(os) && lower.contains(&self.arch),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawIndex {
    List(Vec<RawRelease>),
    Single(RawRelease),
}

#[derive(Debug, Deserialize)]
struct RawRelease {
    tag_name: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    assets: Vec<RawAsset>,
}

#[derive(Debug, Deserialize)]
struct RawAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: Option<u64>,
    /// `sha256:<hex>`, published by GitHub for every uploaded asset.
    #[serde(default)]
    digest: Option<String>,
}

/// Parse a release descriptor and select the best release for `platform`.
pub fn select_release(
    body: &str,
    platform: &Platform,
    include_prereleases: bool,
) -> Result<VersionInfo, UpdateError> {
    let index: RawIndex =
        serde_json::from_str(body).map_err(|e| UpdateError::InvalidDescriptor(e.to_string()))?;
    let releases = match index {
        RawIndex::List(list) => list,
        RawIndex::Single(release) => vec![release],
    };

    let mut best: Option<VersionInfo> = None;
    for release in releases {
        if release.draft || (release.prerelease && !include_prereleases) {
            continue;
        }
        let Ok(version) = SemVer::parse(&release.tag_name) else {
            debug!(tag = %release.tag_name, "skipping release with unparseable tag");
            continue;
        };
        if best.as_ref().is_some_and(|b| b.version >= version) {
            continue;
        }
        let Some(asset) = release.assets.iter().find(|a| platform.matches_asset(&a.name)) else {
            debug!(%version, %platform, "release has no compatible asset");
            continue;
        };
        let checksum_name = format!("{}.sha256", asset.name);
        let checksum_url = release
            .assets
            .iter()
            .find(|a| a.name == checksum_name)
            .map(|a| a.browser_download_url.clone());

        best = Some(VersionInfo {
            version,
            release_date: release.published_at,
            release_notes: release
                .body
                .clone()
                .unwrap_or_else(|| "No release notes available".to_string()),
            package_url: asset.browser_download_url.clone(),
            package_name: asset.name.clone(),
            package_size: asset.size,
            sha256: asset.digest.as_deref().and_then(integrity::parse_digest),
            checksum_url,
        });
    }

    best.ok_or_else(|| UpdateError::NoCompatibleAsset {
        platform: platform.to_string(),
    })
}

/// Blocking HTTP client with the memdoc user agent.
///
/// The blocking client applies `timeout` to each read, which makes it a stall
/// timeout for streamed bodies rather than a cap on total transfer time.
pub fn http_client(timeout: Duration) -> Result<reqwest::blocking::Client, UpdateError> {
    reqwest::blocking::Client::builder()
        .user_agent(format!("memdoc/{}", CURRENT_VERSION))
        .connect_timeout(Duration::from_secs(10))
        .timeout(timeout)
        .build()
        .map_err(|e| UpdateError::Network(format!("failed to create HTTP client: {}", e)))
}

/// Map a non-success status: server trouble is transient, anything else is not.
pub(crate) fn status_error(status: reqwest::StatusCode, url: &str) -> UpdateError {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        UpdateError::Network(format!("{} returned {}", url, status))
    } else {
        UpdateError::InvalidDescriptor(format!("{} returned {}", url, status))
    }
}

pub struct ReleaseRegistryClient {
    endpoint: String,
    http: reqwest::blocking::Client,
    platform: Platform,
    retry: RetrySettings,
    include_prereleases: bool,
}

impl ReleaseRegistryClient {
    pub fn new(settings: &UpdateSettings) -> Result<Self, UpdateError> {
        Ok(Self {
            endpoint: settings.registry_url.clone(),
            http: http_client(Duration::from_secs(10))?,
            platform: Platform::current(),
            retry: settings.retry,
            include_prereleases: settings.include_prereleases,
        })
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    fn fetch_once(&self) -> Result<String, UpdateError> {
        let response = self
            .http
            .get(&self.endpoint)
            .header("Accept", "application/vnd.github+json")
            .send()
            .map_err(|e| UpdateError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, &self.endpoint));
        }
        response
            .text()
            .map_err(|e| UpdateError::Network(e.to_string()))
    }
}

impl ReleaseSource for ReleaseRegistryClient {
    fn check_latest(&self) -> Result<VersionInfo, UpdateError> {
        let body = with_retry(&self.retry, || self.fetch_once())?;
        select_release(&body, &self.platform, self.include_prereleases)
    }
}

/// Run `op`, retrying only [`UpdateError::Network`] failures.
pub fn with_retry<T>(
    policy: &RetrySettings,
    mut op: impl FnMut() -> Result<T, UpdateError>,
) -> Result<T, UpdateError> {
    let attempts = policy.max_attempts.max(1);
    let max_backoff = Duration::from_millis(policy.max_backoff_ms);
    let mut backoff = Duration::from_millis(policy.initial_backoff_ms).min(max_backoff);
    let mut attempt = 1;

    loop {
        match op() {
            Err(UpdateError::Network(message)) if attempt < attempts => {
                warn!(attempt, attempts, %message, "registry check failed, retrying");
                thread::sleep(backoff);
                backoff = (backoff * 2).min(max_backoff);
                attempt += 1;
            }
            result => return result,
        }
    }
}
