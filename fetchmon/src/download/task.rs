//! A single download and its transfer loop.
//!
//! A [`DownloadTask`] is created by the coordinator and shared as
//! `Arc<DownloadTask>`. Its status is only ever changed by the coordinator;
//! the task itself owns the byte counters, the listener set and the run loop.
//!
//! # Run loop
//!
//! ```text
//!   open connection ─► open sink at `downloaded` ─► connect (total)
//!                                                      │
//!        ┌─────────────────────────────────────────────┘
//!        ▼
//!   still current? ──no──► exit (paused / stopped / removed)
//!        │yes
//!   fetch ≤ chunk_size ─► write ─► downloaded += n ─► Progress
//!        │
//!   downloaded == total ──► Completed
//! ```
//!
//! Every exit path closes the sink and the connection before the outcome is
//! reported to the coordinator.

use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;

use super::connection::{Connection, ConnectionSource};
use super::coordinator::{DownloadCoordinator, Shared};
use super::error::{TransferError, TransferResult};
use super::events::{DownloadEvent, DownloadObserver, ListenerSet};
use super::sink::{probe_length, ExistsPolicy, FileSink};
use super::status::Status;

const UNKNOWN_TOTAL: u64 = u64::MAX;

/// Identifier of a download, unique within one coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DownloadId(u64);

impl DownloadId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Point-in-time view of a task, suitable for display or serialization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadSnapshot {
    pub id: DownloadId,
    pub source: String,
    pub destination: PathBuf,
    pub downloaded: u64,
    pub total: Option<u64>,
    pub percent: u64,
    pub status: Status,
    pub queue_position: Option<usize>,
}

/// How a run ended without a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    Completed,
    /// The run was superseded by a pause, stop or removal.
    Halted,
}

/// Parameters fixed when a task is created.
#[derive(Debug, Clone)]
pub(crate) struct TaskSettings {
    pub chunk_size: usize,
    pub exists_policy: ExistsPolicy,
}

/// One resumable download.
pub struct DownloadTask {
    id: DownloadId,
    source: Arc<dyn ConnectionSource>,
    destination: RwLock<PathBuf>,
    total: AtomicU64,
    downloaded: AtomicU64,
    status: RwLock<Status>,
    epoch: AtomicU64,
    settings: TaskSettings,
    /// Cleared once a run has opened its sink under the exists policy.
    fresh: AtomicBool,
    listeners: ListenerSet,
    coordinator: Weak<Shared>,
    /// Held by a run for as long as it owns the destination file.
    io: Mutex<()>,
    runs: Mutex<usize>,
    idle: Condvar,
}

impl DownloadTask {
    pub(crate) fn new(
        id: DownloadId,
        source: Arc<dyn ConnectionSource>,
        destination: PathBuf,
        settings: TaskSettings,
        coordinator: Weak<Shared>,
    ) -> Self {
        let downloaded = match settings.exists_policy {
            ExistsPolicy::Resume => probe_length(&destination),
            ExistsPolicy::Replace | ExistsPolicy::Rename => 0,
        };

        Self {
            id,
            source,
            destination: RwLock::new(destination),
            total: AtomicU64::new(UNKNOWN_TOTAL),
            downloaded: AtomicU64::new(downloaded),
            status: RwLock::new(Status::Inactive),
            epoch: AtomicU64::new(0),
            settings,
            fresh: AtomicBool::new(true),
            listeners: ListenerSet::new(),
            coordinator,
            io: Mutex::new(()),
            runs: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    pub fn id(&self) -> DownloadId {
        self.id
    }

    /// Descriptor of the remote resource.
    pub fn source(&self) -> &Arc<dyn ConnectionSource> {
        &self.source
    }

    /// Local file the download writes to.
    pub fn destination(&self) -> PathBuf {
        self.destination.read().clone()
    }

    /// Bytes on disk.
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::SeqCst)
    }

    /// Size of the remote resource, once a run has connected.
    pub fn total(&self) -> Option<u64> {
        match self.total.load(Ordering::SeqCst) {
            UNKNOWN_TOTAL => None,
            total => Some(total),
        }
    }

    /// Current status.
    pub fn status(&self) -> Status {
        self.status.read().clone()
    }

    /// Integer percentage of the resource on disk; 0 while the size is unknown.
    pub fn percent_downloaded(&self) -> u64 {
        match self.total() {
            Some(total) if total > 0 => {
                (u128::from(self.downloaded()) * 100 / u128::from(total)).min(100) as u64
            }
            _ => 0,
        }
    }

    /// Rank in the waiting queue, `None` unless waiting for a slot.
    pub fn queue_position(&self) -> Option<usize> {
        self.coordinator()
            .and_then(|coordinator| coordinator.queue_position(self.id))
    }

    /// Requests activation. Returns `true` if the task became active now.
    pub fn download(&self) -> bool {
        self.coordinator()
            .is_some_and(|coordinator| coordinator.download(self.id))
    }

    /// Halts an active download, keeping it resumable.
    pub fn pause(&self) -> bool {
        self.coordinator()
            .is_some_and(|coordinator| coordinator.pause(self.id))
    }

    /// Returns an active download to inactive.
    pub fn stop(&self) -> bool {
        self.coordinator()
            .is_some_and(|coordinator| coordinator.stop(self.id))
    }

    /// Stops the download if needed and evicts it permanently.
    pub fn remove(&self) -> bool {
        self.coordinator()
            .is_some_and(|coordinator| coordinator.remove(self.id))
    }

    pub fn add_listener(&self, listener: Arc<dyn DownloadObserver>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn DownloadObserver>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        DownloadSnapshot {
            id: self.id,
            source: self.source.describe(),
            destination: self.destination(),
            downloaded: self.downloaded(),
            total: self.total(),
            percent: self.percent_downloaded(),
            status: self.status(),
            queue_position: self.queue_position(),
        }
    }

    /// Whether a run thread is in flight.
    pub fn is_running(&self) -> bool {
        *self.runs.lock() > 0
    }

    /// Blocks until no run is in flight. Returns `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut runs = self.runs.lock();
        while *runs > 0 {
            if self.idle.wait_until(&mut runs, deadline).timed_out() {
                return *runs == 0;
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Coordinator hooks
    // ------------------------------------------------------------------

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Installs `status`. Callers hold the coordinator's registry lock.
    pub(crate) fn set_status(&self, status: Status) {
        *self.status.write() = status;
    }

    /// Starts a new run epoch, invalidating any run in flight.
    pub(crate) fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn notify(&self, event: &DownloadEvent<'_>) {
        self.listeners.notify(event);
    }

    /// Spawns the run thread for `epoch`.
    pub(crate) fn start(self: &Arc<Self>, epoch: u64) -> io::Result<()> {
        *self.runs.lock() += 1;
        let task = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("fetchmon-{}", self.id.get()))
            .spawn(move || {
                let _guard = RunGuard(&task);
                if panic::catch_unwind(AssertUnwindSafe(|| task.run(epoch))).is_err() {
                    tracing::error!(task = task.id.get(), "Download run panicked");
                    if let Some(coordinator) = task.coordinator() {
                        coordinator.finish_run(
                            task.id,
                            epoch,
                            Status::Error("download thread panicked".to_string()),
                        );
                    }
                }
            });

        match spawned {
            Ok(_) => Ok(()),
            Err(e) => {
                self.run_finished();
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    fn coordinator(&self) -> Option<DownloadCoordinator> {
        self.coordinator.upgrade().map(DownloadCoordinator::from_shared)
    }

    /// A run may touch the file only while it belongs to the current epoch
    /// and the task is still active.
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch() == epoch && matches!(*self.status.read(), Status::Active)
    }

    fn run(&self, epoch: u64) {
        let _io = self.io.lock();
        if !self.is_current(epoch) {
            tracing::debug!(task = self.id.get(), epoch, "Run superseded before start");
            return;
        }

        let mut connection: Option<Box<dyn Connection>> = None;
        let mut sink: Option<FileSink> = None;
        let outcome = self.transfer(epoch, &mut connection, &mut sink);

        if let Some(sink) = sink.as_mut() {
            sink.close();
        }
        if let Some(connection) = connection.as_mut() {
            connection.close();
        }

        let status = match outcome {
            Ok(RunEnd::Halted) => {
                tracing::debug!(
                    task = self.id.get(),
                    downloaded = self.downloaded(),
                    "Run halted"
                );
                return;
            }
            Ok(RunEnd::Completed) => Status::Completed,
            Err(e) => {
                tracing::warn!(
                    task = self.id.get(),
                    source = %self.source.describe(),
                    destination = %self.destination().display(),
                    error = %e,
                    "Download run failed"
                );
                Status::Error(e.to_string())
            }
        };

        if let Some(coordinator) = self.coordinator() {
            coordinator.finish_run(self.id, epoch, status);
        }
    }

    fn transfer(
        &self,
        epoch: u64,
        connection: &mut Option<Box<dyn Connection>>,
        sink: &mut Option<FileSink>,
    ) -> TransferResult<RunEnd> {
        let connection = connection.insert(self.source.open()?);

        // Runs of one task are serialized by `io`, so load and store do not race.
        let policy = if self.fresh.load(Ordering::SeqCst) {
            self.settings.exists_policy
        } else {
            ExistsPolicy::Resume
        };
        let requested = self.destination();
        let sink = sink.insert(FileSink::open(&requested, self.downloaded(), policy)?);
        // The policy stays in force until a sink has actually been opened with it.
        self.fresh.store(false, Ordering::SeqCst);
        self.adopt_sink(&requested, sink);

        let mut offset = sink.start_offset();
        let total = connection.connect(offset)?;
        self.total
            .store(total.unwrap_or(UNKNOWN_TOTAL), Ordering::SeqCst);

        tracing::debug!(
            task = self.id.get(),
            offset,
            total = ?total,
            "Connected"
        );

        if let Some(total) = total {
            if offset > total {
                return Err(TransferError::SizeMismatch {
                    local: offset,
                    remote: total,
                });
            }
            if offset == total {
                return Ok(RunEnd::Completed);
            }
        }

        loop {
            if !self.is_current(epoch) {
                return Ok(RunEnd::Halted);
            }

            let wanted = match total {
                Some(total) => (total - offset).min(self.settings.chunk_size as u64) as usize,
                None => self.settings.chunk_size,
            };
            let bytes = connection.fetch(offset, total, wanted)?;

            if bytes.is_empty() {
                return match total {
                    Some(expected) => Err(TransferError::Truncated {
                        expected,
                        received: offset,
                    }),
                    None => Ok(RunEnd::Completed),
                };
            }

            let received = offset + bytes.len() as u64;
            if let Some(expected) = total.filter(|&expected| received > expected) {
                return Err(TransferError::Overrun { expected, received });
            }

            sink.write(&bytes)?;
            offset = received;
            self.downloaded.store(offset, Ordering::SeqCst);
            self.notify(&DownloadEvent::Progress { task: self });

            if total == Some(offset) {
                return Ok(RunEnd::Completed);
            }
        }
    }

    /// Reconciles the task with where the sink actually writes.
    fn adopt_sink(&self, requested: &Path, sink: &FileSink) {
        if sink.path() != requested {
            tracing::info!(
                task = self.id.get(),
                from = %requested.display(),
                to = %sink.path().display(),
                "Destination exists, writing to renamed file"
            );
            *self.destination.write() = sink.path().to_path_buf();
        }
        if sink.start_offset() != self.downloaded() {
            tracing::warn!(
                task = self.id.get(),
                destination = %sink.path().display(),
                expected = self.downloaded(),
                actual = sink.start_offset(),
                "Local file length changed since last run, resuming from actual length"
            );
            self.downloaded.store(sink.start_offset(), Ordering::SeqCst);
        }
    }

    fn run_finished(&self) {
        let mut runs = self.runs.lock();
        *runs = runs.saturating_sub(1);
        if *runs == 0 {
            self.idle.notify_all();
        }
    }
}

impl fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("destination", &self.destination())
            .field("downloaded", &self.downloaded())
            .field("total", &self.total())
            .field("status", &self.status())
            .finish()
    }
}

/// Marks a run as finished when the run thread exits, even by panic.
struct RunGuard<'a>(&'a DownloadTask);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.run_finished();
    }
}
