//! Tracing subscriber setup.
//!
//! Console output always goes to stderr so it never mixes with command output
//! on stdout. An optional daily-rolling log file can be added; it is written
//! from a background thread that lives as long as the returned [`LogGuard`].
//!
//! Filter precedence: `RUST_LOG`, then [`LoggingConfig::filter`].

use std::path::PathBuf;

use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::UtcOffset;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter directive.
pub const DEFAULT_FILTER: &str = "fetchmon=info";

/// Base name of rolled log files.
pub const LOG_FILE_PREFIX: &str = "fetchmon.log";

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Logging options.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub filter: String,
    /// Directory for the rolling log file; console only when `None`.
    pub log_dir: Option<PathBuf>,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            log_dir: None,
            ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Set the filter directive used when `RUST_LOG` is unset.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Also write logs to a daily-rolling file in `dir`.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }
}

/// Keeps the file writer alive; drop it to flush pending lines.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Installs the global subscriber.
pub fn init(config: &LoggingConfig) -> Result<LogGuard, LoggingError> {
    let directive = std::env::var("RUST_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| config.filter.clone());
    let filter = EnvFilter::try_new(&directive).map_err(|e| LoggingError::Filter {
        filter: directive.clone(),
        reason: e.to_string(),
    })?;

    // Falls back to UTC when the local offset cannot be determined soundly,
    // which is the case in multi-threaded processes on some platforms.
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let timer = OffsetTime::new(offset, Rfc3339);

    let console = fmt::layer()
        .with_timer(timer.clone())
        .with_target(true)
        .with_ansi(config.ansi)
        .with_writer(std::io::stderr);

    let (file, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_timer(timer)
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    Ok(LogGuard { _file: guard })
}
