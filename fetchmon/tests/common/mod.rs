//! Shared fixtures for the download integration tests.
//!
//! [`ScriptedSource`] serves an in-memory resource through the
//! [`Connection`] trait and records how it was used. Fetches can be gated so a
//! test decides exactly when each chunk is delivered. [`RecordingObserver`]
//! keeps an owned copy of every event for later assertions.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use fetchmon::config::CoordinatorConfig;
use fetchmon::download::{
    Connection, ConnectionError, ConnectionResult, ConnectionSource, DownloadCoordinator,
    DownloadEvent, DownloadId, DownloadObserver, ExistsPolicy, Status,
};

/// Upper bound for any wait in these tests.
pub const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// Test Data
// ============================================================================

/// Deterministic, non-repeating-per-chunk payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn coordinator(dir: &Path, max_active: usize, chunk_size: usize) -> DownloadCoordinator {
    coordinator_with_policy(dir, max_active, chunk_size, ExistsPolicy::Resume)
}

pub fn coordinator_with_policy(
    dir: &Path,
    max_active: usize,
    chunk_size: usize,
    policy: ExistsPolicy,
) -> DownloadCoordinator {
    DownloadCoordinator::new(
        CoordinatorConfig::new(dir)
            .with_max_active(max_active)
            .with_chunk_size(chunk_size)
            .with_exists_policy(policy),
    )
}

/// Polls `condition` until it holds or [`WAIT`] elapses.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// ============================================================================
// Scripted Connection
// ============================================================================

/// Counting semaphore controlling when fetches may proceed.
#[derive(Default)]
pub struct Gate {
    /// `None` lets every fetch through.
    permits: Mutex<Option<usize>>,
    changed: Condvar,
}

impl Gate {
    pub fn release(&self, n: usize) {
        let mut permits = self.permits.lock();
        if let Some(p) = permits.as_mut() {
            *p += n;
        }
        self.changed.notify_all();
    }

    pub fn open(&self) {
        *self.permits.lock() = None;
        self.changed.notify_all();
    }

    fn close(&self) {
        *self.permits.lock() = Some(0);
    }

    fn pass(&self) -> bool {
        let deadline = Instant::now() + WAIT;
        let mut permits = self.permits.lock();
        loop {
            match *permits {
                None => return true,
                Some(p) if p > 0 => {
                    *permits = Some(p - 1);
                    return true;
                }
                Some(_) => {}
            }
            if self.changed.wait_until(&mut permits, deadline).timed_out() {
                return false;
            }
        }
    }
}

/// Behaviour and usage counters shared by a source and its connections.
#[derive(Default)]
pub struct Script {
    pub data: Vec<u8>,
    /// Total reported by `connect`; defaults to the data length.
    pub announced_total: Option<Option<u64>>,
    /// Zero-based fetch index (across all runs) that fails.
    pub fail_on_fetch: Option<usize>,
    /// Ignore `max_chunk` and hand out everything that is left.
    pub ignore_max_chunk: bool,
    pub gate: Gate,
    pub opens: AtomicUsize,
    pub connects: Mutex<Vec<u64>>,
    pub fetch_offsets: Mutex<Vec<u64>>,
    pub fetches: AtomicUsize,
    pub closes: AtomicUsize,
}

impl Script {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn fetch_offsets(&self) -> Vec<u64> {
        self.fetch_offsets.lock().clone()
    }

    pub fn connect_offsets(&self) -> Vec<u64> {
        self.connects.lock().clone()
    }
}

/// In-memory resource.
#[derive(Clone)]
pub struct ScriptedSource {
    name: String,
    pub script: Arc<Script>,
}

impl std::fmt::Debug for ScriptedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedSource")
            .field("name", &self.name)
            .field("len", &self.script.data.len())
            .finish()
    }
}

impl ScriptedSource {
    pub fn new(name: &str, data: Vec<u8>) -> Self {
        Self::with_script(
            name,
            Script {
                data,
                ..Default::default()
            },
        )
    }

    pub fn with_script(name: &str, script: Script) -> Self {
        Self {
            name: name.to_string(),
            script: Arc::new(script),
        }
    }

    /// Same resource, but every fetch waits for [`Gate::release`].
    pub fn gated(name: &str, data: Vec<u8>) -> Self {
        let source = Self::new(name, data);
        source.script.gate.close();
        source
    }

    pub fn failing_on(name: &str, data: Vec<u8>, fetch_index: usize) -> Self {
        Self::with_script(
            name,
            Script {
                data,
                fail_on_fetch: Some(fetch_index),
                ..Default::default()
            },
        )
    }

    pub fn announcing(name: &str, data: Vec<u8>, total: Option<u64>) -> Self {
        Self::with_script(
            name,
            Script {
                data,
                announced_total: Some(total),
                ..Default::default()
            },
        )
    }
}

impl ConnectionSource for ScriptedSource {
    fn suggested_file_name(&self) -> String {
        self.name.clone()
    }

    fn describe(&self) -> String {
        format!("scripted://{}", self.name)
    }

    fn open(&self) -> ConnectionResult<Box<dyn Connection>> {
        self.script.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection {
            script: Arc::clone(&self.script),
            position: None,
        }))
    }
}

struct ScriptedConnection {
    script: Arc<Script>,
    position: Option<u64>,
}

impl Connection for ScriptedConnection {
    fn connect(&mut self, start_offset: u64) -> ConnectionResult<Option<u64>> {
        self.script.connects.lock().push(start_offset);
        self.position = Some(start_offset);
        Ok(self
            .script
            .announced_total
            .unwrap_or(Some(self.script.data.len() as u64)))
    }

    fn fetch(
        &mut self,
        offset: u64,
        _total: Option<u64>,
        max_chunk: usize,
    ) -> ConnectionResult<Bytes> {
        let position = self.position.ok_or(ConnectionError::NotConnected)?;
        if position != offset {
            return Err(ConnectionError::OffsetMismatch {
                requested: offset,
                actual: position,
            });
        }
        if !self.script.gate.pass() {
            return Err(ConnectionError::Other("gate never opened".to_string()));
        }

        let index = self.script.fetches.fetch_add(1, Ordering::SeqCst);
        self.script.fetch_offsets.lock().push(offset);
        if self.script.fail_on_fetch == Some(index) {
            return Err(ConnectionError::Other(format!(
                "simulated fault on chunk {}",
                index + 1
            )));
        }

        let data = &self.script.data;
        let start = (offset as usize).min(data.len());
        let end = if self.script.ignore_max_chunk {
            data.len()
        } else {
            (start + max_chunk).min(data.len())
        };
        self.position = Some(end as u64);
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    fn close(&mut self) {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
        self.position = None;
    }
}

// ============================================================================
// Recording Observer
// ============================================================================

/// Owned copy of a [`DownloadEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Progress {
        id: DownloadId,
        downloaded: u64,
        total: Option<u64>,
    },
    Status {
        id: DownloadId,
        status: Status,
    },
}

#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Recorded>>,
    changed: Condvar,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    /// Status changes of `id`, in delivery order.
    pub fn statuses(&self, id: DownloadId) -> Vec<Status> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Recorded::Status { id: i, status } if *i == id => Some(status.clone()),
                _ => None,
            })
            .collect()
    }

    /// `downloaded` values reported by progress events of `id`.
    pub fn progress(&self, id: DownloadId) -> Vec<u64> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Recorded::Progress {
                    id: i, downloaded, ..
                } if *i == id => Some(*downloaded),
                _ => None,
            })
            .collect()
    }

    /// Blocks until `predicate` holds for the recorded events.
    pub fn wait_for(&self, predicate: impl Fn(&[Recorded]) -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        let mut events = self.events.lock();
        while !predicate(&events) {
            if self.changed.wait_until(&mut events, deadline).timed_out() {
                return predicate(&events);
            }
        }
        true
    }

    /// Blocks until `id` has reported a status of the same kind as `status`.
    pub fn wait_for_status(&self, id: DownloadId, status: &Status) -> bool {
        let kind = status.kind();
        self.wait_for(|events| {
            events.iter().any(|e| {
                matches!(e, Recorded::Status { id: i, status: s } if *i == id && s.kind() == kind)
            })
        })
    }
}

impl DownloadObserver for RecordingObserver {
    fn on_event(&self, event: &DownloadEvent<'_>) {
        let record = match event {
            DownloadEvent::Progress { task } => Recorded::Progress {
                id: task.id(),
                downloaded: task.downloaded(),
                total: task.total(),
            },
            DownloadEvent::StatusChanged { task, status } => Recorded::Status {
                id: task.id(),
                status: (*status).clone(),
            },
        };
        self.events.lock().push(record);
        self.changed.notify_all();
    }
}
