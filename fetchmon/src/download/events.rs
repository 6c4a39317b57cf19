//! Progress and status-change notifications.
//!
//! Every task carries a [`ListenerSet`]. Events are delivered synchronously,
//! in registration order, on the thread that produced them. A listener that
//! panics is logged and skipped; the remaining listeners still receive the
//! event and the task is unaffected.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

use super::status::Status;
use super::task::DownloadTask;

/// Notification emitted by a download task.
#[derive(Debug, Clone, Copy)]
pub enum DownloadEvent<'a> {
    /// A chunk was written; `task.downloaded()` reflects it.
    Progress { task: &'a DownloadTask },
    /// The task accepted a transition to `status`.
    StatusChanged {
        task: &'a DownloadTask,
        status: &'a Status,
    },
}

impl<'a> DownloadEvent<'a> {
    /// Task the event refers to.
    pub fn task(&self) -> &'a DownloadTask {
        match self {
            DownloadEvent::Progress { task } => task,
            DownloadEvent::StatusChanged { task, .. } => task,
        }
    }
}

/// Receiver of download events.
pub trait DownloadObserver: Send + Sync {
    fn on_event(&self, event: &DownloadEvent<'_>);
}

impl<F> DownloadObserver for F
where
    F: Fn(&DownloadEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &DownloadEvent<'_>) {
        self(event)
    }
}

/// Ordered set of observers attached to one task.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn DownloadObserver>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `listener`. Adding the same `Arc` twice is a no-op.
    pub fn add(&self, listener: Arc<dyn DownloadObserver>) {
        let mut listeners = self.listeners.write();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Removes `listener`, returning whether it was attached.
    pub fn remove(&self, listener: &Arc<dyn DownloadObserver>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Delivers `event` to every listener.
    ///
    /// The list is snapshotted first so listeners may add or remove
    /// listeners from inside the callback.
    pub fn notify(&self, event: &DownloadEvent<'_>) {
        let snapshot: Vec<_> = self.listeners.read().clone();
        for listener in snapshot {
            let result = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
            if result.is_err() {
                tracing::warn!(
                    task = event.task().id().get(),
                    "Download listener panicked; continuing delivery"
                );
            }
        }
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .finish()
    }
}

/// Observer that mirrors status changes into the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl DownloadObserver for TracingObserver {
    fn on_event(&self, event: &DownloadEvent<'_>) {
        match event {
            DownloadEvent::Progress { task } => {
                tracing::trace!(
                    task = task.id().get(),
                    downloaded = task.downloaded(),
                    total = ?task.total(),
                    "Chunk written"
                );
            }
            DownloadEvent::StatusChanged { task, status } => match status {
                Status::Error(message) => tracing::warn!(
                    task = task.id().get(),
                    destination = %task.destination().display(),
                    error = %message,
                    "Download failed"
                ),
                _ => tracing::info!(
                    task = task.id().get(),
                    destination = %task.destination().display(),
                    status = %status,
                    "Download status changed"
                ),
            },
        }
    }
}
