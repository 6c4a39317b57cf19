//! fetchmon CLI - Command-line interface
//!
//! Downloads files through the fetchmon coordinator and manages its
//! configuration file.

mod commands;
mod error;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fetchmon::logging::{self, LoggingConfig};

use commands::config::ConfigCommands;
use commands::get::GetArgs;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "fetchmon", version, about = "Resumable, queued file downloads")]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to a daily file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download one or more URLs
    Get(GetArgs),

    /// View or modify configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

fn main() {
    let cli = Cli::parse();

    let mut logging_config = LoggingConfig::default();
    if cli.verbose {
        logging_config = logging_config.with_filter("fetchmon=debug");
    }
    if let Some(dir) = &cli.log_dir {
        logging_config = logging_config.with_log_dir(dir);
    }
    let guard = match logging::init(&logging_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: {}", CliError::from(e));
            None
        }
    };

    let result = run(cli);
    drop(guard);

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config_path = commands::common::config_path(cli.config)?;
    match cli.command {
        Commands::Get(args) => commands::get::run(args, &config_path),
        Commands::Config(command) => commands::config::run(command, &config_path),
    }
}
