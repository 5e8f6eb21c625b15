//! Installer handoff for memdoc updates and rollbacks.
//!
//! The running binary cannot replace itself while it executes, so installation
//! is handed to a detached process and the caller exits. Installer-style
//! packages run unattended with flags that close running instances and
//! relaunch afterwards. Raw binaries (and every rollback) go through a small
//! helper script that waits for this process to exit, copies the staged binary
//! over the installed one, and starts it again.

use crate::commit::CommitPointer;
use crate::error::UpdateError;
use crate::version::SemVer;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::info;

/// Unattended flags for installer-style packages.
pub const SILENT_INSTALL_FLAGS: [&str; 4] = [
    "/VERYSILENT",
    "/SUPPRESSMSGBOXES",
    "/CLOSEAPPLICATIONS",
    "/RESTARTAPPLICATIONS",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageKind {
    /// A native installer executable.
    Installer,
    /// A drop-in replacement for the application binary.
    Binary,
}

impl PackageKind {
    pub fn from_file_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.contains("setup") || lower.contains("installer") {
            PackageKind::Installer
        } else {
            PackageKind::Binary
        }
    }
}

/// Where a staged package came from. Downloads are deleted after install;
/// backups are left where they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedOrigin {
    Download,
    Backup,
}

/// A verified package ready to be handed to the installer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedInstall {
    pub package: PathBuf,
    pub version: SemVer,
    pub kind: PackageKind,
    pub origin: StagedOrigin,
}

/// Launches installation of a staged package.
///
/// Fire-and-forget: success means the handoff process started, not that the
/// install finished. The caller is expected to exit afterwards.
pub trait Installer: Send + Sync {
    fn hand_off(&self, staged: &StagedInstall) -> Result<(), UpdateError>;
}

impl<I: Installer + ?Sized> CommitPointer<StagedInstall> for I {
    type Error = UpdateError;

    fn flip(&self, staged: &StagedInstall) -> Result<(), UpdateError> {
        self.hand_off(staged)
    }
}

/// Installer for the platform this binary runs on.
pub struct PlatformInstaller {
    target_exe: PathBuf,
    script_dir: PathBuf,
}

impl PlatformInstaller {
    pub fn new(target_exe: impl Into<PathBuf>, script_dir: impl Into<PathBuf>) -> Self {
        Self {
            target_exe: target_exe.into(),
            script_dir: script_dir.into(),
        }
    }

    fn run_installer(&self, staged: &StagedInstall) -> Result<(), UpdateError> {
        let mut command = Command::new(&staged.package);
        command.args(SILENT_INSTALL_FLAGS);
        detach(&mut command)
            .spawn()
            .map_err(|e| UpdateError::InstallHandoff(format!("cannot launch installer: {}", e)))?;
        Ok(())
    }

    fn run_replacement(&self, staged: &StagedInstall) -> Result<(), UpdateError> {
        fs::create_dir_all(&self.script_dir)
            .map_err(|e| UpdateError::InstallHandoff(format!("cannot create script dir: {}", e)))?;
        let remove_source = staged.origin == StagedOrigin::Download;
        let pid = std::process::id();

        let (script_path, content, mut command) = if cfg!(windows) {
            let path = self.script_dir.join("update.bat");
            let content = windows_script(pid, &staged.package, &self.target_exe, remove_source);
            let mut command = Command::new("cmd");
            command.arg("/C").arg(&path);
            (path, content, command)
        } else {
            let path = self.script_dir.join("update.sh");
            let content = unix_script(pid, &staged.package, &self.target_exe, remove_source);
            let mut command = Command::new("sh");
            command.arg(&path);
            (path, content, command)
        };

        fs::write(&script_path, content)
            .map_err(|e| UpdateError::InstallHandoff(format!("cannot write update script: {}", e)))?;
        detach(&mut command)
            .spawn()
            .map_err(|e| UpdateError::InstallHandoff(format!("cannot launch update script: {}", e)))?;
        Ok(())
    }
}

impl Installer for PlatformInstaller {
    fn hand_off(&self, staged: &StagedInstall) -> Result<(), UpdateError> {
        if !staged.package.is_file() {
            return Err(UpdateError::InstallHandoff(format!(
                "staged package missing: {}",
                staged.package.display()
            )));
        }
        info!(
            version = %staged.version,
            kind = ?staged.kind,
            package = %staged.package.display(),
            "handing off to installer"
        );
        match staged.kind {
            PackageKind::Installer if cfg!(windows) => self.run_installer(staged),
            _ => self.run_replacement(staged),
        }
    }
}

fn detach(command: &mut Command) -> &mut Command {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }
    command
}

fn sh_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

/// POSIX helper: wait for `pid`, swap the binary in, relaunch, delete itself.
pub fn unix_script(pid: u32, staged: &Path, target: &Path, remove_source: bool) -> String {
    let staged_q = sh_quote(staged);
    let target_q = sh_quote(target);
    let next_q = sh_quote(&target.with_extension("new"));
    let mut script = format!(
        "#!/bin/sh\n\
         while kill -0 {pid} 2>/dev/null; do sleep 1; done\n\
         cp -f {staged_q} {next_q} || exit 1\n\
         chmod 755 {next_q}\n\
         mv -f {next_q} {target_q} || exit 1\n"
    );
    if remove_source {
        script.push_str(&format!("rm -f {staged_q}\n"));
    }
    script.push_str(&format!(
        "nohup {target_q} >/dev/null 2>&1 &\n\
         rm -f \"$0\"\n"
    ));
    script
}

/// Batch equivalent of [`unix_script`].
pub fn windows_script(pid: u32, staged: &Path, target: &Path, remove_source: bool) -> String {
    let staged = staged.display();
    let target = target.display();
    let mut script = format!(
        "@echo off\r\n\
         :wait\r\n\
         tasklist /FI \"PID eq {pid}\" 2>NUL | find \"{pid}\" >NUL\r\n\
         if not errorlevel 1 (\r\n\
         \x20   timeout /t 1 /nobreak >NUL\r\n\
         \x20   goto wait\r\n\
         )\r\n\
         copy /y \"{staged}\" \"{target}\" >NUL\r\n\
         if errorlevel 1 exit /b 1\r\n"
    );
    if remove_source {
        script.push_str(&format!("del \"{staged}\"\r\n"));
    }
    script.push_str(&format!(
        "start \"\" \"{target}\"\r\n\
         del \"%~f0\"\r\n"
    ));
    script
}
