//! Common types and utilities shared across CLI commands.

use std::path::PathBuf;

use clap::ValueEnum;
use fetchmon::config::ConfigFile;
use fetchmon::download::ExistsPolicy;

use crate::error::CliError;

/// What to do when a destination file already exists.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum ExistsArg {
    /// Continue after the bytes already on disk
    Resume,
    /// Truncate and start over
    Replace,
    /// Write to `name(1).ext`, `name(2).ext`, ...
    Rename,
}

impl From<ExistsArg> for ExistsPolicy {
    fn from(arg: ExistsArg) -> Self {
        match arg {
            ExistsArg::Resume => ExistsPolicy::Resume,
            ExistsArg::Replace => ExistsPolicy::Replace,
            ExistsArg::Rename => ExistsPolicy::Rename,
        }
    }
}

/// The `--config` override, or the platform default location.
pub fn config_path(explicit: Option<PathBuf>) -> Result<PathBuf, CliError> {
    match explicit {
        Some(path) => Ok(path),
        None => Ok(ConfigFile::default_path()?),
    }
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
