//! Version identity of the running build and of published releases.
//!
//! Version strings are parsed strictly: `MAJOR.MINOR.PATCH` with an optional
//! pre-release/build suffix and an optional leading `v`. Anything else is
//! rejected, and a rejected remote version never counts as an update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Version of this build.
pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A semantic version with a total order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SemVer(semver::Version);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("ambiguous version string {input:?}: {reason}")]
pub struct VersionParseError {
    pub input: String,
    pub reason: String,
}

impl SemVer {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        SemVer(semver::Version::new(major, minor, patch))
    }

    pub fn parse(input: &str) -> Result<Self, VersionParseError> {
        let trimmed = input.trim();
        let bare = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        semver::Version::parse(bare)
            .map(SemVer)
            .map_err(|e| VersionParseError {
                input: input.to_string(),
                reason: e.to_string(),
            })
    }

    /// Version of the running binary.
    pub fn current() -> Self {
        // CARGO_PKG_VERSION is validated by cargo, so this only falls back on a broken build.
        Self::parse(CURRENT_VERSION).unwrap_or_else(|_| SemVer::new(0, 0, 0))
    }

    pub fn is_prerelease(&self) -> bool {
        !self.0.pre.is_empty()
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SemVer {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SemVer {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SemVer> for String {
    fn from(v: SemVer) -> Self {
        v.to_string()
    }
}

/// A published release. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: SemVer,
    pub release_date: Option<DateTime<Utc>>,
    pub release_notes: String,
    pub package_url: String,
    /// File name of the package asset.
    pub package_name: String,
    /// Size advertised by the registry, if any.
    pub package_size: Option<u64>,
    /// Lowercase hex SHA-256 advertised alongside the asset.
    #[serde(default)]
    pub sha256: Option<String>,
    /// URL of a published SHA-256 digest for the package.
    #[serde(default)]
    pub checksum_url: Option<String>,
}

impl VersionInfo {
    /// True if this release is strictly newer than `current`.
    pub fn is_newer_than(&self, current: &SemVer) -> bool {
        update_available(current, &self.version)
    }
}

/// `remote > current` under the total SemVer order.
pub fn update_available(current: &SemVer, remote: &SemVer) -> bool {
    remote > current
}

/// String form of [`update_available`]. Unparseable input means no update.
pub fn update_available_str(current: &str, remote: &str) -> bool {
    match (SemVer::parse(current), SemVer::parse(remote)) {
        (Ok(c), Ok(r)) => update_available(&c, &r),
        _ => false,
    }
}
