//! CLI error type and exit codes.

use fetchmon::config::ConfigError;
use fetchmon::download::CoordinatorError;
use fetchmon::logging::LoggingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Config(String),

    #[error(transparent)]
    ConfigFile(#[from] ConfigError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error("failed to initialize logging: {0}")]
    Logging(#[from] LoggingError),

    #[error("failed to write output: {0}")]
    Output(String),

    #[error("{failed} of {total} downloads did not complete")]
    Incomplete { failed: usize, total: usize },

    #[error("interrupted; partial files were kept")]
    Interrupted,
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) | CliError::ConfigFile(_) | CliError::Logging(_) => 2,
            CliError::Interrupted => 130,
            _ => 1,
        }
    }
}
