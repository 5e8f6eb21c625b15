//! Rough copy-time estimate, shown before a migration starts.
//!
//! Throughput is assumed, not measured: 100 MiB/s when source and destination
//! share a device, 50 MiB/s otherwise or when that cannot be determined.

use crate::relocate::verify::{dir_stats, TreeStats};
use std::io;
use std::path::Path;
use std::time::Duration;

pub const SAME_DEVICE_BYTES_PER_SEC: u64 = 100 * 1024 * 1024;
pub const CROSS_DEVICE_BYTES_PER_SEC: u64 = 50 * 1024 * 1024;

const MIN_ESTIMATE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationEstimate {
    pub stats: TreeStats,
    /// `None` when the devices could not be compared.
    pub same_device: Option<bool>,
    pub duration: Duration,
}

/// Estimate how long copying `source` to `destination` takes.
pub fn estimate_migration(source: &Path, destination: &Path) -> io::Result<MigrationEstimate> {
    let stats = dir_stats(source)?;
    let same_device = same_device(source, destination);
    Ok(MigrationEstimate {
        stats,
        same_device,
        duration: estimate_duration(stats.bytes, same_device.unwrap_or(false)),
    })
}

pub fn estimate_duration(bytes: u64, same_device: bool) -> Duration {
    let rate = if same_device {
        SAME_DEVICE_BYTES_PER_SEC
    } else {
        CROSS_DEVICE_BYTES_PER_SEC
    };
    Duration::from_secs_f64(bytes as f64 / rate as f64).max(MIN_ESTIMATE)
}

/// The destination may not exist yet; its nearest existing ancestor decides.
fn same_device(source: &Path, destination: &Path) -> Option<bool> {
    let existing = destination.ancestors().find(|p| p.exists())?;
    device_of(source)
        .zip(device_of(existing))
        .map(|(a, b)| a == b)
}

#[cfg(unix)]
fn device_of(path: &Path) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).ok().map(|m| m.dev())
}

// Drive letter or UNC share.
#[cfg(not(unix))]
fn device_of(path: &Path) -> Option<String> {
    use std::path::Component;
    match path.canonicalize().ok()?.components().next()? {
        Component::Prefix(prefix) => Some(prefix.as_os_str().to_string_lossy().to_lowercase()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::populate_tree;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_duration_from_size_and_device() {
        assert_eq!(estimate_duration(1000 * MIB, true), Duration::from_secs(10));
        assert_eq!(estimate_duration(1000 * MIB, false), Duration::from_secs(20));
    }

    #[test]
    fn test_small_trees_take_at_least_a_second() {
        assert_eq!(estimate_duration(0, true), Duration::from_secs(1));
        assert_eq!(estimate_duration(10 * MIB, true), Duration::from_secs(1));
    }

    #[test]
    fn test_estimate_for_sibling_directory() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("data");
        populate_tree(&source, 10);

        let estimate = estimate_migration(&source, &temp.path().join("new").join("data")).unwrap();
        assert_eq!(estimate.stats.files, 10);
        assert_eq!(estimate.same_device, Some(true));
        assert_eq!(estimate.duration, Duration::from_secs(1));
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let temp = TempDir::new().unwrap();
        assert!(estimate_migration(&temp.path().join("gone"), temp.path()).is_err());
    }
}
