//! Data directory subcommands.

use crate::cli::update::human_bytes;
use crate::cli::{DataAction, RelocateArgs};
use crate::config::ConfigStore;
use crate::relocate::{dir_stats, DataRelocator, MigrationEstimate, MigrationState, ValidateOptions};
use crate::signal;
use colored::Colorize;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn run(config: &Arc<ConfigStore>, action: DataAction) -> Result<(), i32> {
    match action {
        DataAction::Show => show(config),
        DataAction::Validate(args) => validate(config, &args),
        DataAction::Migrate(args) => migrate(config, &args),
    }
}

fn options(args: &RelocateArgs) -> ValidateOptions {
    ValidateOptions {
        allow_non_empty: args.allow_non_empty,
    }
}

fn show(config: &Arc<ConfigStore>) -> Result<(), i32> {
    let snapshot = config.snapshot();
    let active = &snapshot.data_directory;

    println!("{} {}", "Config:".bold(), config.path().display());
    println!("{} {}", "Data directory:".bold(), active.path.display());
    match dir_stats(&active.path) {
        Ok(stats) => println!("  {} files, {}", stats.files, human_bytes(stats.bytes)),
        Err(e) => println!("  {} {}", "unreadable:".red(), e),
    }
    if let Some(at) = active.last_verified_at {
        println!("  verified {}", at.format("%Y-%m-%d %H:%M"));
    }
    if let Some(record) = &snapshot.last_migration {
        println!(
            "{} {} → {} ({} files, {})",
            "Last migration:".bold(),
            record.from.display().to_string().dimmed(),
            record.to.display(),
            record.files,
            record.at.format("%Y-%m-%d %H:%M")
        );
        if record.from.exists() {
            println!(
                "  The previous directory still exists. Remove it yourself once you no longer need it."
            );
        }
    }
    Ok(())
}

fn print_estimate(relocator: &DataRelocator, destination: &Path) {
    match relocator.estimate(destination) {
        Ok(MigrationEstimate {
            stats, duration, ..
        }) => println!(
            "  {} files, {}; estimated copy time {}",
            stats.files,
            human_bytes(stats.bytes),
            human_duration(duration).bold()
        ),
        Err(e) => tracing::debug!(error = %e, "could not estimate migration time"),
    }
}

fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs().max(1);
    if secs < 60 {
        format!("~{} s", secs)
    } else {
        format!("~{} min {} s", secs / 60, secs % 60)
    }
}

/// Success with an estimate on stdout; the reason on stderr otherwise.
fn validate(config: &Arc<ConfigStore>, args: &RelocateArgs) -> Result<(), i32> {
    let relocator = DataRelocator::new(Arc::clone(config));
    match relocator.validate(&args.path, options(args)) {
        Ok(()) => {
            println!("{} {} can receive the data", "✓".green().bold(), args.path.display());
            print_estimate(&relocator, &args.path);
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            Err(1)
        }
    }
}

fn migrate(config: &Arc<ConfigStore>, args: &RelocateArgs) -> Result<(), i32> {
    let relocator = Arc::new(DataRelocator::new(Arc::clone(config)));
    println!("Moving data to {}", args.path.display());
    print_estimate(&relocator, &args.path);
    let handle = relocator
        .spawn_migration(&args.path, options(args))
        .map_err(|e| {
            eprintln!("{} {}", "error:".red().bold(), e);
            1
        })?;
    if let Err(e) = signal::cancel_on_signal(&handle.cancel_token()) {
        tracing::warn!(error = %e, "could not install signal handler");
    }

    loop {
        let job = handle.status();
        if job.is_finished() {
            break;
        }
        match job.state {
            MigrationState::Copying => {
                eprint!("\rCopying {}/{} files", job.files_copied, job.total_files);
                let _ = std::io::stderr().flush();
            }
            MigrationState::Verifying => {
                eprint!("\rVerifying {} files...     ", job.files_copied);
                let _ = std::io::stderr().flush();
            }
            _ => {}
        }
        thread::sleep(POLL_INTERVAL);
    }

    let job = handle.wait();
    eprintln!();
    match job.state {
        MigrationState::Committed => {
            println!(
                "{} Data moved to {} ({} files)",
                "✓".green().bold(),
                job.destination.display(),
                job.files_copied
            );
            println!(
                "  The old directory {} was kept. Delete it yourself when you are sure.",
                job.source.display().to_string().dimmed()
            );
            Ok(())
        }
        MigrationState::Aborted(e) => {
            eprintln!("{} {} failed: {}", "error:".red().bold(), e.stage(), e);
            eprintln!(
                "Your data is still in {} and nothing was deleted.",
                job.source.display()
            );
            if job.files_copied > 0 {
                eprintln!(
                    "{} partially copied files were left in {} for inspection.",
                    job.files_copied,
                    job.destination.display()
                );
            }
            Err(1)
        }
        _ => Err(1),
    }
}
