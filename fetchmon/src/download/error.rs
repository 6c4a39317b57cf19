//! Error types for transfers and the coordinator.

use std::path::PathBuf;

use thiserror::Error;

use super::connection::ConnectionError;
use super::sink::SinkError;

/// Result type for a single transfer run.
pub type TransferResult<T> = Result<T, TransferError>;

/// Result type for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Faults that end a run in the error state.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Connecting to or reading from the remote resource failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Opening or writing the local file failed.
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// The local file is longer than the remote resource.
    #[error("local file has {local} bytes but the remote resource has only {remote}")]
    SizeMismatch { local: u64, remote: u64 },

    /// The stream ended before the announced size was reached.
    #[error("stream ended after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },

    /// The remote side delivered more bytes than it announced.
    #[error("received {received} bytes, more than the announced {expected}")]
    Overrun { expected: u64, received: u64 },
}

/// Errors reported when enrolling a download.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Another download already writes to this destination.
    #[error("a download to {} is already enrolled", .0.display())]
    DuplicateDestination(PathBuf),

    /// The remote resource could not be described.
    #[error("invalid source: {0}")]
    Source(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_descriptive() {
        let err = TransferError::Truncated {
            expected: 3000,
            received: 1000,
        };
        assert_eq!(err.to_string(), "stream ended after 1000 of 3000 bytes");

        let err = TransferError::from(ConnectionError::Other("reset by peer".into()));
        assert_eq!(err.to_string(), "reset by peer");

        let err = CoordinatorError::DuplicateDestination(PathBuf::from("/tmp/a.bin"));
        assert!(err.to_string().contains("/tmp/a.bin"));
    }
}
