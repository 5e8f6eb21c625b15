use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Process-level single-instance lock.
///
/// Held for the lifetime of the process. On Unix it is backed by flock(2) and
/// released automatically if the holder is killed; on Windows the lock file is
/// opened without sharing, which the OS releases with the handle.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

/// Another process already holds the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHeld {
    pub path: PathBuf,
    /// PID recorded by the holder, when readable.
    pub holder_pid: Option<u32>,
}

impl InstanceLock {
    const LOCK_FILE: &'static str = "instance.lock";

    /// Try to acquire without blocking. `Err(LockHeld)` inside `Ok` if another
    /// instance is running.
    pub fn try_acquire(dir: &Path) -> Result<std::result::Result<Self, LockHeld>> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(Self::LOCK_FILE);

        let mut options = OpenOptions::new();
        options.create(true).read(true).write(true).truncate(false);
        #[cfg(windows)]
        {
            use std::os::windows::fs::OpenOptionsExt;
            options.share_mode(0);
        }

        let mut file = match options.open(&path) {
            Ok(file) => file,
            #[cfg(windows)]
            Err(e) if e.raw_os_error() == Some(32) => {
                // ERROR_SHARING_VIOLATION
                return Ok(Err(LockHeld {
                    path,
                    holder_pid: None,
                }));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open {}", path.display()));
            }
        };

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if ret != 0 {
                let holder_pid = read_pid(&mut file);
                return Ok(Err(LockHeld { path, holder_pid }));
            }
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;

        tracing::debug!(path = %path.display(), "acquired instance lock");
        Ok(Ok(Self { file, path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn read_pid(file: &mut File) -> Option<u32> {
    use std::io::Read;

    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    content.trim().parse().ok()
}

#[cfg(unix)]
impl Drop for InstanceLock {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
