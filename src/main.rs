use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use memdoc::cli::{self, Cli, Commands};
use memdoc::config::{paths, ConfigStore};
use memdoc::lock::InstanceLock;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_logging(args.verbose);

    let config_path = match args.config {
        Some(path) => path,
        None => paths::config_path().context("Could not determine home directory")?,
    };
    let home = paths::home_for_config(&config_path);

    // Only one memdoc may touch the config and data directory at a time
    let lock = match InstanceLock::try_acquire(&home)? {
        Ok(lock) => lock,
        Err(held) => {
            let holder = held
                .holder_pid
                .map(|pid| format!(" (PID {})", pid))
                .unwrap_or_default();
            eprintln!(
                "{} memdoc is already running{}. Close it and try again.",
                "error:".red().bold(),
                holder
            );
            std::process::exit(1);
        }
    };

    let config = match ConfigStore::open(&config_path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    tracing::debug!(path = %config.path().display(), "config loaded");

    let result = match args.command {
        Commands::Update { action } => cli::update::run(&config, action),
        Commands::Data { action } => cli::data::run(&config, action),
    };

    drop(lock);
    if let Err(code) = result {
        std::process::exit(code);
    }
    Ok(())
}
