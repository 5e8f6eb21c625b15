//! CLI subcommand infrastructure for memdoc.
//!
//! Subcommands return `Result<(), i32>`, where the error is the process exit code.

pub mod data;
pub mod update;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "memdoc")]
#[command(version, about = "Safe updates and data relocation for MemDoc", long_about = None)]
pub struct Cli {
    /// Config file to use (default: ~/.memdoc/config.json, or $MEMDOC_CONFIG)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short = 'v', long = "verbose", global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands for memdoc.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check for, install and roll back application updates
    Update {
        #[command(subcommand)]
        action: UpdateAction,
    },

    /// Inspect or relocate the data directory
    Data {
        #[command(subcommand)]
        action: DataAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum UpdateAction {
    /// Check for a newer release (exit code 0 = up-to-date, 1 = available)
    Check(CheckArgs),

    /// Download, verify and install the latest release
    Install(InstallArgs),

    /// List backups of previous versions
    Backups,

    /// Reinstall a previously backed-up version
    Rollback {
        #[arg(value_name = "VERSION")]
        version: String,
    },

    /// Delete the backup of a version
    RemoveBackup {
        #[arg(value_name = "VERSION")]
        version: String,
    },
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Ignore the cached result of the last check
    #[arg(long)]
    pub refresh: bool,
}

#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Install without asking for confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

#[derive(Subcommand, Debug)]
pub enum DataAction {
    /// Show the active data directory
    Show,

    /// Check whether a directory can receive the data
    Validate(RelocateArgs),

    /// Copy the data to a new directory and switch to it
    Migrate(RelocateArgs),
}

#[derive(Args, Debug)]
pub struct RelocateArgs {
    /// Destination directory
    #[arg(value_name = "PATH")]
    pub path: PathBuf,

    /// Accept a destination that already contains files
    #[arg(long)]
    pub allow_non_empty: bool,
}

/// Ask a yes/no question on stderr. Anything but "y"/"yes" is a no.
pub(crate) fn confirm(prompt: &str) -> bool {
    use std::io::{BufRead, Write};

    eprint!("{} [y/N] ", prompt);
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
