//! Tree listing, statistics and post-copy verification.

use crate::error::MigrationError;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;
use xxhash_rust::xxh3::Xxh3;

/// File count and total size of a directory tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub files: u64,
    pub bytes: u64,
}

/// Count regular files under `root` and sum their sizes.
pub fn dir_stats(root: &Path) -> io::Result<TreeStats> {
    let mut stats = TreeStats::default();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            stats.files += 1;
            stats.bytes += entry.metadata().map_err(io::Error::from)?.len();
        }
    }
    Ok(stats)
}

/// Relative paths and sizes of every regular file under `root`, sorted.
pub(crate) fn list_files(root: &Path) -> io::Result<Vec<(PathBuf, u64)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let len = entry.metadata().map_err(io::Error::from)?.len();
        if let Ok(relative) = entry.path().strip_prefix(root) {
            files.push((relative.to_path_buf(), len));
        }
    }
    files.sort();
    Ok(files)
}

/// Relative paths of every directory under `root` (not `root` itself), sorted.
pub(crate) fn list_dirs(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).follow_links(true) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_dir() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            dirs.push(relative.to_path_buf());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// `count` indices spread evenly over `0..len`, always including the first
/// and, when more than one is taken, the last.
pub fn sample_indices(len: usize, count: usize) -> Vec<usize> {
    if len == 0 || count == 0 {
        return Vec::new();
    }
    if count >= len {
        return (0..len).collect();
    }
    if count == 1 {
        return vec![0];
    }
    let mut picked: Vec<usize> = (0..count).map(|i| i * (len - 1) / (count - 1)).collect();
    picked.dedup();
    picked
}

fn xxh3_file(path: &Path) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Xxh3::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        match reader.read(&mut buf)? {
            0 => break,
            n => hasher.update(&buf[..n]),
        }
    }
    Ok(hasher.digest())
}

/// Confirm `destination` holds a faithful copy of `source`.
///
/// Every source directory must exist at the destination, empty ones included.
/// Every source file must exist there with the same size, and a deterministic
/// sample of up to `sample_size` files is compared by content hash. Unless
/// `allow_extra` is set the destination must hold exactly as many files and
/// directories as the source.
pub fn verify_tree(
    source: &Path,
    destination: &Path,
    sample_size: usize,
    allow_extra: bool,
) -> Result<u64, MigrationError> {
    verify_dirs(source, destination, allow_extra)?;

    let expected = list_files(source).map_err(|e| MigrationError::io(source, e))?;
    let actual: HashMap<PathBuf, u64> = list_files(destination)
        .map_err(|e| MigrationError::IntegrityCheckFailed(e.to_string()))?
        .into_iter()
        .collect();

    if !allow_extra && actual.len() != expected.len() {
        return Err(MigrationError::IntegrityCheckFailed(format!(
            "file count mismatch: source has {}, destination has {}",
            expected.len(),
            actual.len()
        )));
    }

    for (relative, len) in &expected {
        match actual.get(relative) {
            None => {
                return Err(MigrationError::IntegrityCheckFailed(format!(
                    "missing at destination: {}",
                    relative.display()
                )))
            }
            Some(copied) if copied != len => {
                return Err(MigrationError::IntegrityCheckFailed(format!(
                    "size mismatch for {}: expected {} bytes, found {}",
                    relative.display(),
                    len,
                    copied
                )))
            }
            Some(_) => {}
        }
    }

    for index in sample_indices(expected.len(), sample_size) {
        let relative = &expected[index].0;
        let original = xxh3_file(&source.join(relative)).map_err(|e| MigrationError::io(source, e))?;
        let copy = xxh3_file(&destination.join(relative))
            .map_err(|e| MigrationError::IntegrityCheckFailed(e.to_string()))?;
        if original != copy {
            return Err(MigrationError::IntegrityCheckFailed(format!(
                "content mismatch for {}",
                relative.display()
            )));
        }
        debug!(file = %relative.display(), hash = original, "sample verified");
    }

    Ok(expected.len() as u64)
}

fn verify_dirs(source: &Path, destination: &Path, allow_extra: bool) -> Result<(), MigrationError> {
    let expected = list_dirs(source).map_err(|e| MigrationError::io(source, e))?;
    let actual: HashSet<PathBuf> = list_dirs(destination)
        .map_err(|e| MigrationError::IntegrityCheckFailed(e.to_string()))?
        .into_iter()
        .collect();

    if let Some(missing) = expected.iter().find(|dir| !actual.contains(*dir)) {
        return Err(MigrationError::IntegrityCheckFailed(format!(
            "missing directory at destination: {}",
            missing.display()
        )));
    }
    if !allow_extra && actual.len() != expected.len() {
        return Err(MigrationError::IntegrityCheckFailed(format!(
            "directory count mismatch: source has {}, destination has {}",
            expected.len(),
            actual.len()
        )));
    }
    Ok(())
}
