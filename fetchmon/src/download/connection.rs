//! Transport seam between a download task and the remote resource.
//!
//! A task owns a [`ConnectionSource`], an immutable descriptor of where the
//! bytes live. Each run opens a fresh [`Connection`] from it, so no stateful
//! transport object is ever shared between threads.

use std::fmt;
use std::io;

use bytes::Bytes;
use thiserror::Error;

/// Result type for transport operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Errors raised while connecting to or reading from a remote resource.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The request could not be sent or the response could not be received.
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The request timed out.
    #[error("request to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    /// The server answered with an unexpected status code.
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    /// A resume was requested but the server ignored the byte range.
    #[error("{url} does not support resuming from byte {offset}")]
    RangeNotSupported { url: String, offset: u64 },

    /// Reading the response body failed.
    #[error("read error: {0}")]
    Read(#[source] io::Error),

    /// `fetch` was asked for an offset the connection is not positioned at.
    #[error("connection is at byte {actual}, fetch requested byte {requested}")]
    OffsetMismatch { requested: u64, actual: u64 },

    /// `fetch` was called before `connect` or after `close`.
    #[error("connection is not open")]
    NotConnected,

    /// Any other transport failure.
    #[error("{0}")]
    Other(String),
}

/// Immutable descriptor of a remote resource.
///
/// Implementations must be cheap to share; the task keeps one for its whole
/// lifetime and opens a new [`Connection`] per run.
pub trait ConnectionSource: Send + Sync + fmt::Debug {
    /// File name the resource suggests for its local copy.
    fn suggested_file_name(&self) -> String;

    /// Human-readable location, used in logs (usually the URL).
    fn describe(&self) -> String;

    /// Creates an independent connection for one run.
    fn open(&self) -> ConnectionResult<Box<dyn Connection>>;
}

/// A stateful, single-run connection to a remote resource.
pub trait Connection: Send {
    /// Connects and positions the stream at `start_offset`.
    ///
    /// Returns the authoritative total size of the resource, or `None` when
    /// the remote side does not announce one.
    fn connect(&mut self, start_offset: u64) -> ConnectionResult<Option<u64>>;

    /// Reads the next chunk starting at `offset`.
    ///
    /// Returns at most `max_chunk` bytes; fewer at the end of the resource
    /// and an empty buffer once the stream is exhausted.
    fn fetch(&mut self, offset: u64, total: Option<u64>, max_chunk: usize)
        -> ConnectionResult<Bytes>;

    /// Releases the underlying transport. Safe to call more than once.
    fn close(&mut self);
}
