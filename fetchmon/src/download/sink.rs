//! Random-access local writer with resume support.
//!
//! [`FileSink::open`] decides where writing starts based on the
//! [`ExistsPolicy`] when the destination already has content:
//!
//! | Policy  | Destination           | Start offset                       |
//! |---------|-----------------------|------------------------------------|
//! | Resume  | unchanged             | requested offset, at most file len |
//! | Replace | unchanged (truncated) | 0                                  |
//! | Rename  | `name(N).ext`         | 0                                  |

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

/// Result type for sink operations.
pub type SinkResult<T> = Result<T, SinkError>;

/// Errors raised by the local writer.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Failed to create the destination's parent directory.
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    /// Failed to open or create the destination file.
    #[error("failed to open {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    /// Failed to position the destination file.
    #[error("failed to seek {} to byte {offset}: {source}", path.display())]
    Seek {
        path: PathBuf,
        offset: u64,
        source: io::Error,
    },

    /// Failed to write to the destination file.
    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    /// Write attempted after `close`.
    #[error("{} is already closed", path.display())]
    Closed { path: PathBuf },
}

/// What to do when the destination already has content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistsPolicy {
    /// Keep the existing bytes and continue at the requested offset.
    #[default]
    Resume,
    /// Discard the existing file and start over.
    Replace,
    /// Leave the existing file alone and write to the first free sibling name.
    Rename,
}

impl ExistsPolicy {
    /// Name used in configuration files and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExistsPolicy::Resume => "resume",
            ExistsPolicy::Replace => "replace",
            ExistsPolicy::Rename => "rename",
        }
    }
}

impl fmt::Display for ExistsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExistsPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "resume" => Ok(ExistsPolicy::Resume),
            "replace" => Ok(ExistsPolicy::Replace),
            "rename" => Ok(ExistsPolicy::Rename),
            other => Err(format!(
                "unknown exists policy '{}' (expected resume, replace or rename)",
                other
            )),
        }
    }
}

/// Length of an existing local file, 0 if it does not exist.
pub fn probe_length(path: &Path) -> u64 {
    fs::metadata(path)
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .unwrap_or(0)
}

/// First sibling of `path` named `stem(N).ext` that does not exist yet.
///
/// The counter is inserted before the last `.` of the file name, or appended
/// when there is none.
pub fn disambiguate(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let split = name.rfind('.').filter(|&i| i > 0).unwrap_or(name.len());
    let (stem, ext) = name.split_at(split);

    (1u32..)
        .map(|i| path.with_file_name(format!("{}({}){}", stem, i, ext)))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Destination file opened for one run.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
    start_offset: u64,
    position: u64,
}

impl FileSink {
    /// Open `path` for writing at `start_offset`, applying `policy` if the
    /// file already exists.
    pub fn open(path: &Path, start_offset: u64, policy: ExistsPolicy) -> SinkResult<Self> {
        let exists = path.exists();
        let (path, start_offset) = match policy {
            _ if !exists => (path.to_path_buf(), 0),
            ExistsPolicy::Resume => (path.to_path_buf(), start_offset.min(probe_length(path))),
            ExistsPolicy::Replace => (path.to_path_buf(), 0),
            ExistsPolicy::Rename => (disambiguate(path), 0),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| SinkError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| SinkError::Open {
                path: path.clone(),
                source,
            })?;

        // Anything past the resume point was never counted as downloaded.
        file.set_len(start_offset)
            .and_then(|_| file.seek(SeekFrom::Start(start_offset)))
            .map_err(|source| SinkError::Seek {
                path: path.clone(),
                offset: start_offset,
                source,
            })?;

        Ok(Self {
            path,
            file: Some(file),
            start_offset,
            position: start_offset,
        })
    }

    /// Path actually being written (differs from the request under `Rename`).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset writing started at.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Offset of the next write.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Append `bytes` at the current position.
    pub fn write(&mut self, bytes: &[u8]) -> SinkResult<()> {
        let file = self.file.as_mut().ok_or_else(|| SinkError::Closed {
            path: self.path.clone(),
        })?;
        file.write_all(bytes).map_err(|source| SinkError::Write {
            path: self.path.clone(),
            source,
        })?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Whether the file handle is still open.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Flush and release the file handle. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush() {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to flush download file");
            }
        }
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        self.close();
    }
}
