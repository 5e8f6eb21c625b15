//! Destination checks run before (and again at the start of) a migration.

use crate::error::ValidationError;
use crate::relocate::verify::dir_stats;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

const WRITE_PROBE: &str = ".memdoc_write_test";

/// Free space required on the destination, relative to the source size.
const SPACE_HEADROOM: f64 = 1.1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidateOptions {
    /// Accept a destination that already has content.
    pub allow_non_empty: bool,
}

/// Check that `source` may be relocated to `destination`.
pub fn validate_destination(
    source: &Path,
    destination: &Path,
    options: ValidateOptions,
) -> Result<(), ValidationError> {
    if destination.as_os_str().is_empty() {
        return Err(ValidationError::InvalidPath("path is empty".to_string()));
    }
    if !destination.is_absolute() {
        return Err(ValidationError::InvalidPath(format!(
            "{} is not an absolute path",
            destination.display()
        )));
    }

    let source = normalize(source);
    let destination = normalize(destination);

    if source == destination {
        return Err(ValidationError::SameAsActive);
    }
    if !source.is_dir() {
        return Err(ValidationError::SourceMissing(source));
    }
    if destination.starts_with(&source) {
        return Err(ValidationError::InsideSource);
    }
    if source.starts_with(&destination) {
        return Err(ValidationError::ContainsSource);
    }

    let probe_dir = if destination.exists() {
        if !destination.is_dir() {
            return Err(ValidationError::NotADirectory);
        }
        let entries = fs::read_dir(&destination)
            .map_err(|e| ValidationError::NotWritable(e.to_string()))?
            .count();
        if entries > 0 && !options.allow_non_empty {
            return Err(ValidationError::NotEmpty { entries });
        }
        destination.clone()
    } else {
        match destination.parent() {
            Some(parent) if parent.is_dir() => parent.to_path_buf(),
            Some(parent) => return Err(ValidationError::ParentMissing(parent.to_path_buf())),
            None => {
                return Err(ValidationError::InvalidPath(format!(
                    "{} has no parent directory",
                    destination.display()
                )))
            }
        }
    };

    probe_writable(&probe_dir).map_err(|e| ValidationError::NotWritable(e.to_string()))?;
    check_space(&source, &probe_dir)
}

fn probe_writable(dir: &Path) -> io::Result<()> {
    let probe = dir.join(WRITE_PROBE);
    fs::write(&probe, b"test")?;
    fs::remove_file(&probe)
}

fn check_space(source: &Path, dir: &Path) -> Result<(), ValidationError> {
    let Some(available) = available_space(dir) else {
        return Ok(());
    };
    let used = dir_stats(source)
        .map_err(|_| ValidationError::SourceMissing(source.to_path_buf()))?
        .bytes;
    let needed = (used as f64 * SPACE_HEADROOM).ceil() as u64;
    debug!(needed, available, "destination space");
    if available < needed {
        return Err(ValidationError::InsufficientSpace { needed, available });
    }
    Ok(())
}

/// Bytes available to unprivileged users on the filesystem holding `dir`.
#[cfg(unix)]
#[allow(clippy::unnecessary_cast)]
fn available_space(dir: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(dir.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        debug!(error = %io::Error::last_os_error(), "statvfs failed, skipping space check");
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn available_space(_dir: &Path) -> Option<u64> {
    None
}

/// Resolve symlinks where the path exists and strip `.`/`..` elsewhere, so
/// two spellings of one directory compare equal.
fn normalize(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
        if let Ok(parent) = parent.canonicalize() {
            return parent.join(name);
        }
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::populate_tree;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("data");
        populate_tree(&source, 10);
        (temp, source)
    }

    #[test]
    fn test_empty_destination_accepted() {
        let (temp, source) = setup();
        let dest = temp.path().join("new");
        fs::create_dir(&dest).unwrap();
        assert_eq!(validate_destination(&source, &dest, ValidateOptions::default()), Ok(()));
        assert!(!dest.join(WRITE_PROBE).exists());
    }

    #[test]
    fn test_missing_destination_with_parent_accepted() {
        let (temp, source) = setup();
        assert_eq!(
            validate_destination(&source, &temp.path().join("new"), ValidateOptions::default()),
            Ok(())
        );
    }

    #[test]
    fn test_non_empty_destination_rejected_unless_confirmed() {
        let (temp, source) = setup();
        let dest = temp.path().join("new");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("unrelated.txt"), b"x").unwrap();

        assert_eq!(
            validate_destination(&source, &dest, ValidateOptions::default()),
            Err(ValidationError::NotEmpty { entries: 1 })
        );
        let reuse = ValidateOptions {
            allow_non_empty: true,
        };
        assert_eq!(validate_destination(&source, &dest, reuse), Ok(()));
    }

    #[test]
    fn test_same_as_active_rejected() {
        let (_temp, source) = setup();
        assert_eq!(
            validate_destination(&source, &source, ValidateOptions::default()),
            Err(ValidationError::SameAsActive)
        );
        let dotted = source.join("chapters").join("..");
        assert_eq!(
            validate_destination(&source, &dotted, ValidateOptions::default()),
            Err(ValidationError::SameAsActive)
        );
    }

    #[test]
    fn test_nested_destinations_rejected() {
        let (temp, source) = setup();
        assert_eq!(
            validate_destination(&source, &source.join("inner"), ValidateOptions::default()),
            Err(ValidationError::InsideSource)
        );
        let reuse = ValidateOptions {
            allow_non_empty: true,
        };
        assert_eq!(
            validate_destination(&source, temp.path(), reuse),
            Err(ValidationError::ContainsSource)
        );
    }

    #[test]
    fn test_file_destination_rejected() {
        let (temp, source) = setup();
        let file = temp.path().join("file.txt");
        fs::write(&file, b"x").unwrap();
        assert_eq!(
            validate_destination(&source, &file, ValidateOptions::default()),
            Err(ValidationError::NotADirectory)
        );
    }

    #[test]
    fn test_missing_parent_rejected() {
        let (temp, source) = setup();
        let dest = temp.path().join("a").join("b");
        assert!(matches!(
            validate_destination(&source, &dest, ValidateOptions::default()),
            Err(ValidationError::ParentMissing(_))
        ));
    }

    #[test]
    fn test_relative_path_rejected() {
        let (_temp, source) = setup();
        assert!(matches!(
            validate_destination(&source, Path::new("relative/dir"), ValidateOptions::default()),
            Err(ValidationError::InvalidPath(_))
        ));
        assert!(matches!(
            validate_destination(&source, Path::new(""), ValidateOptions::default()),
            Err(ValidationError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_missing_source_reported() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            validate_destination(
                &temp.path().join("gone"),
                &temp.path().join("new"),
                ValidateOptions::default()
            ),
            Err(ValidationError::SourceMissing(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_read_only_destination_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let (temp, source) = setup();
        let dest = temp.path().join("ro");
        fs::create_dir(&dest).unwrap();
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o555)).unwrap();

        // Root ignores directory permissions.
        if fs::write(dest.join("probe"), b"x").is_ok() {
            return;
        }
        assert!(matches!(
            validate_destination(&source, &dest, ValidateOptions::default()),
            Err(ValidationError::NotWritable(_))
        ));
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o755)).unwrap();
    }
}
