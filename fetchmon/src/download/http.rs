//! HTTP transport with resume support.
//!
//! Resumption relies on HTTP Range requests:
//! - `Range: bytes=N-` is sent whenever a run starts past byte 0
//! - `206 Partial Content` carries the total size in `Content-Range`
//! - `200 OK` for a non-zero offset means the server ignored the range
//! - `416 Range Not Satisfiable` reports the total size in `Content-Range: bytes */T`,
//!   which happens when the local copy already covers the whole resource

use std::io::{ErrorKind, Read};
use std::time::Duration;

use bytes::Bytes;
use percent_encoding::percent_decode_str;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{StatusCode, Url};

use super::connection::{Connection, ConnectionError, ConnectionResult, ConnectionSource};
use crate::config::DEFAULT_TIMEOUT_SECS;

/// File name used when the URL does not end in a usable path segment.
pub const FALLBACK_FILE_NAME: &str = "download.bin";

/// A remote resource reachable over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpSource {
    url: String,
    client: Client,
    pub(crate) timeout: Duration,
}

impl HttpSource {
    /// Create a source with the default timeout.
    pub fn new(url: impl Into<String>) -> ConnectionResult<Self> {
        Self::with_timeout(url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a source with a custom timeout.
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> ConnectionResult<Self> {
        let url = url.into();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| ConnectionError::Request {
                url: url.clone(),
                source,
            })?;

        Ok(Self {
            url,
            client,
            timeout,
        })
    }

    /// Create a source sharing an existing client.
    pub fn with_client(url: impl Into<String>, client: Client, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            client,
            timeout,
        }
    }

    /// The resource URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl ConnectionSource for HttpSource {
    fn suggested_file_name(&self) -> String {
        file_name_from_url(&self.url)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }

    fn open(&self) -> ConnectionResult<Box<dyn Connection>> {
        Ok(Box::new(HttpConnection {
            url: self.url.clone(),
            client: self.client.clone(),
            timeout: self.timeout,
            stream: Stream::Idle,
            position: 0,
        }))
    }
}

enum Stream {
    Idle,
    Open(Response),
    Exhausted,
}

/// One run's HTTP connection.
pub struct HttpConnection {
    url: String,
    client: Client,
    timeout: Duration,
    stream: Stream,
    position: u64,
}

impl HttpConnection {
    fn request_error(&self, e: reqwest::Error) -> ConnectionError {
        if e.is_timeout() {
            ConnectionError::Timeout {
                url: self.url.clone(),
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            ConnectionError::Request {
                url: self.url.clone(),
                source: e,
            }
        }
    }
}

impl Connection for HttpConnection {
    fn connect(&mut self, start_offset: u64) -> ConnectionResult<Option<u64>> {
        self.close();

        let mut request = self.client.get(&self.url);
        if start_offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", start_offset));
        }

        let response = request.send().map_err(|e| self.request_error(e))?;
        let status = response.status();

        let total = match status {
            StatusCode::PARTIAL_CONTENT => content_range_total(response.headers())
                .or_else(|| content_length(response.headers()).map(|len| start_offset + len)),
            StatusCode::RANGE_NOT_SATISFIABLE => {
                self.position = start_offset;
                self.stream = Stream::Exhausted;
                return Ok(content_range_total(response.headers()));
            }
            s if s.is_success() && start_offset > 0 => {
                return Err(ConnectionError::RangeNotSupported {
                    url: self.url.clone(),
                    offset: start_offset,
                });
            }
            s if s.is_success() => content_length(response.headers()),
            s => {
                return Err(ConnectionError::Status {
                    url: self.url.clone(),
                    status: s.as_u16(),
                });
            }
        };

        tracing::debug!(url = %self.url, start_offset, ?total, status = status.as_u16(), "connected");

        self.position = start_offset;
        self.stream = Stream::Open(response);
        Ok(total)
    }

    fn fetch(
        &mut self,
        offset: u64,
        _total: Option<u64>,
        max_chunk: usize,
    ) -> ConnectionResult<Bytes> {
        if offset != self.position {
            return Err(ConnectionError::OffsetMismatch {
                requested: offset,
                actual: self.position,
            });
        }

        let response = match &mut self.stream {
            Stream::Open(response) => response,
            Stream::Exhausted => return Ok(Bytes::new()),
            Stream::Idle => return Err(ConnectionError::NotConnected),
        };

        let mut buffer = vec![0u8; max_chunk];
        let mut filled = 0;
        while filled < max_chunk {
            match response.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ConnectionError::Read(e)),
            }
        }
        buffer.truncate(filled);

        if filled == 0 {
            self.stream = Stream::Exhausted;
        }
        self.position += filled as u64;
        Ok(Bytes::from(buffer))
    }

    fn close(&mut self) {
        self.stream = Stream::Idle;
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range_total)
}

/// Extracts the complete length from a `Content-Range` value.
///
/// Accepts `bytes 0-99/1000` and `bytes */1000`; returns `None` for an
/// unknown length (`bytes 0-99/*`) or a malformed header.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = rest.split_once('/')?;
    total.trim().parse::<u64>().ok()
}

/// Derives a local file name from the last path segment of a URL.
///
/// The segment is percent-decoded and stripped of characters that are not
/// valid in file names; [`FALLBACK_FILE_NAME`] is used when nothing remains.
pub fn file_name_from_url(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .map(|s| percent_decode_str(&s).decode_utf8_lossy().to_string())
        .map(|s| sanitize_file_name(&s))
        .filter(|s| !s.is_empty() && s != "." && s != "..")
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}
