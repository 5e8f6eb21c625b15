//! Update check cache.
//!
//! The last registry answer is kept for 24 hours so repeated `update check`
//! runs do not hit the registry API every time.

use crate::error::UpdateError;
use crate::update::registry::{Platform, ReleaseSource};
use crate::version::VersionInfo;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// How long a cached update check remains valid.
const CACHE_TTL_HOURS: i64 = 24;

/// Cached result of a registry check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCheckCache {
    pub checked_at: DateTime<Utc>,
    /// Platform the answer was computed for.
    pub platform: String,
    /// `None` records "no compatible asset".
    pub latest: Option<VersionInfo>,
}

impl UpdateCheckCache {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.checked_at) < Duration::hours(CACHE_TTL_HOURS)
    }
}

/// Load the cache if it exists, parses, and is younger than 24 hours.
pub fn load_cache(path: &Path) -> Option<UpdateCheckCache> {
    let content = fs::read_to_string(path).ok()?;
    let cache: UpdateCheckCache = serde_json::from_str(&content).ok()?;
    cache.is_fresh(Utc::now()).then_some(cache)
}

/// Save update check result to cache. Silently ignores errors.
pub fn save_cache(path: &Path, cache: &UpdateCheckCache) {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let Ok(content) = serde_json::to_string_pretty(cache) else {
        return;
    };
    let _ = fs::write(path, content);
}

/// A [`ReleaseSource`] that answers from the cache when it can.
pub struct CachedSource<S> {
    inner: S,
    path: PathBuf,
    platform: Platform,
    refresh: bool,
}

impl<S: ReleaseSource> CachedSource<S> {
    pub fn new(inner: S, path: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            path: path.into(),
            platform: Platform::current(),
            refresh: false,
        }
    }

    /// Ignore any cached answer and query the registry.
    pub fn refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    fn cached(&self) -> Option<Result<VersionInfo, UpdateError>> {
        if self.refresh {
            return None;
        }
        let cache = load_cache(&self.path)?;
        if cache.platform != self.platform.to_string() {
            return None;
        }
        debug!(checked_at = %cache.checked_at, "using cached update check");
        Some(cache.latest.ok_or_else(|| UpdateError::NoCompatibleAsset {
            platform: cache.platform,
        }))
    }
}

impl<S: ReleaseSource> ReleaseSource for CachedSource<S> {
    fn check_latest(&self) -> Result<VersionInfo, UpdateError> {
        if let Some(answer) = self.cached() {
            return answer;
        }

        let result = self.inner.check_latest();
        let latest = match &result {
            Ok(info) => Some(info.clone()),
            Err(UpdateError::NoCompatibleAsset { .. }) => None,
            // Transient failures are not remembered.
            Err(_) => return result,
        };
        save_cache(
            &self.path,
            &UpdateCheckCache {
                checked_at: Utc::now(),
                platform: self.platform.to_string(),
                latest,
            },
        );
        result
    }
}
