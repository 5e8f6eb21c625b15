//! Update subcommand for memdoc.
//!
//! Checks for updates, installs them through the orchestrator, and manages
//! backups. Package-manager and development installs are told how to update
//! instead of being replaced.

use crate::cancel::CancelToken;
use crate::cli::{confirm, UpdateAction};
use crate::config::{paths, ConfigStore};
use crate::error::UpdateError;
use crate::signal;
use crate::update::detection::detect_install_method;
use crate::update::{
    BackupStore, CachedSource, InstallMethod, PackageDownloader, PlatformInstaller,
    ReleaseRegistryClient, UpdateOrchestrator, UpdateState,
};
use crate::version::SemVer;
use colored::Colorize;
use std::fmt::Display;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Run an update subcommand.
pub fn run(config: &Arc<ConfigStore>, action: UpdateAction) -> Result<(), i32> {
    match action {
        UpdateAction::Check(args) => check(config, args.refresh),
        UpdateAction::Install(args) => install(config, args.yes),
        UpdateAction::Backups => list_backups(config),
        UpdateAction::Rollback { version } => rollback(config, &version),
        UpdateAction::RemoveBackup { version } => remove_backup(config, &version),
    }
}

fn error(e: impl Display) -> i32 {
    eprintln!("{} {}", "error:".red().bold(), e);
    1
}

fn current_exe() -> Result<PathBuf, UpdateError> {
    std::env::current_exe().map_err(|e| UpdateError::io(Path::new("current executable"), e))
}

fn backup_store(config: &Arc<ConfigStore>) -> BackupStore {
    BackupStore::new(paths::backup_dir(&config.home())).with_history(Arc::clone(config))
}

fn orchestrator(config: &Arc<ConfigStore>, refresh: bool) -> Result<UpdateOrchestrator, UpdateError> {
    let settings = config.update_settings();
    let home = config.home();
    let exe = current_exe()?;

    let source = CachedSource::new(
        ReleaseRegistryClient::new(&settings)?,
        paths::update_cache_path(&home),
    )
    .refresh(refresh);
    let downloader = PackageDownloader::new(paths::staging_dir(&home), &settings)?;
    let installer = Arc::new(PlatformInstaller::new(&exe, paths::staging_dir(&home)));

    Ok(UpdateOrchestrator::new(
        Box::new(source),
        downloader,
        backup_store(config),
        installer,
        SemVer::current(),
        exe,
    ))
}

fn parse_version(version: &str) -> Result<SemVer, i32> {
    SemVer::parse(version).map_err(error)
}

/// Exit code 1 signals "update available" for scripting.
fn check(config: &Arc<ConfigStore>, refresh: bool) -> Result<(), i32> {
    let mut orch = orchestrator(config, refresh).map_err(error)?;
    eprintln!("Checking for updates...");

    match orch.check() {
        Ok(None) => {
            println!(
                "{} memdoc {} is up to date.",
                "✓".green().bold(),
                orch.current_version()
            );
            Ok(())
        }
        Ok(Some(info)) => {
            println!(
                "{} Update available: {} → {}",
                "●".yellow().bold(),
                orch.current_version().to_string().dimmed(),
                info.version.to_string().green().bold()
            );
            if !info.release_notes.trim().is_empty() {
                println!("\n{}", info.release_notes.trim());
            }
            Err(1)
        }
        Err(e) => Err(error(e)),
    }
}

fn install(config: &Arc<ConfigStore>, yes: bool) -> Result<(), i32> {
    let exe = current_exe().map_err(error)?;
    match detect_install_method(&exe) {
        InstallMethod::SelfManaged => {}
        InstallMethod::PackageManager { name, upgrade_cmd } => {
            println!(
                "memdoc was installed via {}. Update with:\n  {}",
                name.bold(),
                upgrade_cmd.cyan()
            );
            return Ok(());
        }
        InstallMethod::Development => {
            println!(
                "This is a development build ({}). Rebuild from source to update.",
                exe.display().to_string().dimmed()
            );
            return Ok(());
        }
    }

    let mut orch = orchestrator(config, true).map_err(error)?;
    eprintln!("Checking for updates...");
    let info = match orch.check() {
        Ok(Some(info)) => info,
        Ok(None) => {
            println!(
                "{} memdoc {} is up to date.",
                "✓".green().bold(),
                orch.current_version()
            );
            return Ok(());
        }
        Err(e) => return Err(error(e)),
    };

    println!(
        "{} Update available: {} → {}",
        "●".yellow().bold(),
        orch.current_version().to_string().dimmed(),
        info.version.to_string().green().bold()
    );
    if !yes && !confirm("Download and install now?") {
        let _ = orch.decline();
        return Ok(());
    }

    let interrupted = CancelToken::new();
    if let Err(e) = signal::cancel_on_signal(&interrupted) {
        tracing::warn!(error = %e, "could not install signal handler");
    }

    orch.start_download().map_err(error)?;
    loop {
        if interrupted.is_cancelled() {
            let _ = orch.cancel();
            eprintln!("\n{} Update cancelled.", "✗".red().bold());
            return Err(1);
        }
        match orch.poll() {
            UpdateState::Downloading { progress, .. } => {
                match progress.percent() {
                    Some(pct) => eprint!("\rDownloading {} ... {:5.1}%", info.package_name, pct),
                    None => eprint!(
                        "\rDownloading {} ... {}",
                        info.package_name,
                        human_bytes(progress.bytes_downloaded)
                    ),
                }
                let _ = std::io::stderr().flush();
            }
            UpdateState::Downloaded { .. } => {
                eprintln!("\rDownloading {} ... done  ", info.package_name);
                break;
            }
            UpdateState::Failed { stage, reason } => {
                eprintln!();
                return Err(report_failure(*stage, reason));
            }
            _ => break,
        }
        thread::sleep(POLL_INTERVAL);
    }

    eprintln!("Backing up memdoc {} ...", orch.current_version());
    match orch.install() {
        Ok(backup) => {
            println!(
                "{} Backup saved to {}",
                "✓".green().bold(),
                backup.binary_path.display().to_string().dimmed()
            );
            println!(
                "{} Installing {}; memdoc will restart when it is done.",
                "✓".green().bold(),
                info.version.to_string().green().bold()
            );
            Ok(())
        }
        Err(e) => match orch.state() {
            UpdateState::Failed { stage, .. } => Err(report_failure(*stage, &e)),
            _ => Err(error(e)),
        },
    }
}

fn report_failure(stage: crate::update::FailureStage, reason: &UpdateError) -> i32 {
    eprintln!(
        "{} {} failed: {}",
        "error:".red().bold(),
        stage,
        reason
    );
    if matches!(reason, UpdateError::Unverifiable(_)) {
        eprintln!(
            "Set {} in the {} block of config.json to accept releases without a published digest.",
            "\"allow_unverified\": true".cyan(),
            "\"update\"".bold()
        );
    } else if stage.retry_safe() {
        eprintln!("Nothing was changed. Run the command again to retry.");
    } else {
        eprintln!("The installed version was not replaced. Check the message above before retrying.");
    }
    1
}

fn list_backups(config: &Arc<ConfigStore>) -> Result<(), i32> {
    let backups = backup_store(config).list_backups().map_err(error)?;
    if backups.is_empty() {
        println!("No backups.");
        return Ok(());
    }
    for backup in backups {
        println!(
            "  {}  {}  {}",
            format!("v{}", backup.version).bold(),
            backup.created_at.format("%Y-%m-%d %H:%M"),
            backup.binary_path.display().to_string().dimmed()
        );
    }
    Ok(())
}

fn rollback(config: &Arc<ConfigStore>, version: &str) -> Result<(), i32> {
    let version = parse_version(version)?;
    let mut orch = orchestrator(config, false).map_err(error)?;
    match orch.rollback(&version) {
        Ok(()) => {
            println!(
                "{} Restoring memdoc {}; it will restart when it is done.",
                "✓".green().bold(),
                version.to_string().green().bold()
            );
            Ok(())
        }
        Err(e) => match orch.state() {
            UpdateState::Failed { stage, .. } => Err(report_failure(*stage, &e)),
            _ => Err(error(e)),
        },
    }
}

fn remove_backup(config: &Arc<ConfigStore>, version: &str) -> Result<(), i32> {
    let version = parse_version(version)?;
    backup_store(config).remove(&version).map_err(error)?;
    println!("{} Removed backup of {}", "✓".green().bold(), version);
    Ok(())
}

pub(crate) fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
