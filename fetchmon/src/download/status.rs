//! Download lifecycle states and the transition table.
//!
//! A task is always in exactly one [`Status`]. The verbs a caller can issue
//! (`download`, `pause`, `stop`, `remove`) are resolved here into the status
//! they *request*; whether the request is honoured is decided by
//! [`transition::is_allowed`] and by the coordinator's bookkeeping.
//!
//! ```text
//!              download (slot free)
//!   Inactive ─────────────────────────► Active ──► Completed
//!      │  ▲                              │ │ │        │
//!      │  └──────── stop ────────────────┘ │ └─► Error│
//!      │                                   ▼     │    │
//!      │                                 Paused  │    │
//!      │                                   │     │    │
//!      └──────────── remove ───────────────┴─────┴────┴──► Removed
//! ```

use std::fmt;

use serde::Serialize;

/// Current lifecycle phase of a download.
///
/// Values are plain data; bookkeeping for a transition is performed by the
/// coordinator, never by the status itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum Status {
    /// Enrolled but not transferring.
    Inactive,
    /// Admitted to the active set; a run thread is transferring bytes.
    Active,
    /// Halted by the user; resumable.
    Paused,
    /// The last run failed with the given description.
    Error(String),
    /// All bytes of the resource are on disk.
    Completed,
    /// Permanently evicted from the coordinator. Terminal.
    Removed,
}

/// Fieldless discriminant of [`Status`], used by the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Inactive,
    Active,
    Paused,
    Error,
    Completed,
    Removed,
}

impl StatusKind {
    /// Every kind, in declaration order.
    pub const ALL: [StatusKind; 6] = [
        StatusKind::Inactive,
        StatusKind::Active,
        StatusKind::Paused,
        StatusKind::Error,
        StatusKind::Completed,
        StatusKind::Removed,
    ];
}

impl Status {
    /// Returns the discriminant of this status.
    pub fn kind(&self) -> StatusKind {
        match self {
            Status::Inactive => StatusKind::Inactive,
            Status::Active => StatusKind::Active,
            Status::Paused => StatusKind::Paused,
            Status::Error(_) => StatusKind::Error,
            Status::Completed => StatusKind::Completed,
            Status::Removed => StatusKind::Removed,
        }
    }

    /// Status requested by `download()` from this state.
    pub fn download_target(&self) -> Option<Status> {
        match self {
            Status::Inactive | Status::Paused | Status::Error(_) | Status::Completed => {
                Some(Status::Active)
            }
            Status::Active | Status::Removed => None,
        }
    }

    /// Status requested by `pause()` from this state.
    pub fn pause_target(&self) -> Option<Status> {
        match self {
            Status::Active => Some(Status::Paused),
            _ => None,
        }
    }

    /// Status requested by `stop()` from this state.
    pub fn stop_target(&self) -> Option<Status> {
        match self {
            Status::Active => Some(Status::Inactive),
            _ => None,
        }
    }

    /// Sequence of statuses `remove()` walks through from this state.
    ///
    /// An active download is stopped first so observers see it leave the
    /// active set before it is removed.
    pub fn removal_path(&self) -> Vec<Status> {
        match self {
            Status::Active => vec![Status::Inactive, Status::Removed],
            Status::Removed => Vec::new(),
            _ => vec![Status::Removed],
        }
    }

    /// Whether a download in this state can hold a rank in the waiting queue.
    pub fn is_queueable(&self) -> bool {
        matches!(
            self,
            Status::Inactive | Status::Paused | Status::Error(_)
        )
    }

    /// Returns a copy carrying only state-intrinsic data.
    pub fn shallow_copy(&self) -> Status {
        self.clone()
    }

    /// Error description, if this is an error status.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Status::Error(message) => Some(message),
            _ => None,
        }
    }

    /// True for `Removed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Removed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Inactive => write!(f, "inactive"),
            Status::Active => write!(f, "active"),
            Status::Paused => write!(f, "paused"),
            Status::Error(message) => write!(f, "error: {}", message),
            Status::Completed => write!(f, "completed"),
            Status::Removed => write!(f, "removed"),
        }
    }
}

/// The transition table.
pub mod transition {
    use super::StatusKind;

    /// Returns whether a download may move from `from` to `to`.
    ///
    /// Everything not listed here is a silent no-op for the caller.
    pub fn is_allowed(from: StatusKind, to: StatusKind) -> bool {
        use StatusKind::*;

        matches!(
            (from, to),
            (Inactive, Active)
                | (Inactive, Removed)
                | (Active, Paused)
                | (Active, Inactive)
                | (Active, Error)
                | (Active, Completed)
                | (Paused, Active)
                | (Paused, Removed)
                | (Error, Active)
                | (Error, Removed)
                | (Completed, Active)
                | (Completed, Removed)
        )
    }

    /// Statuses reachable in one step from `from`.
    pub fn targets(from: StatusKind) -> impl Iterator<Item = StatusKind> {
        StatusKind::ALL
            .into_iter()
            .filter(move |to| is_allowed(from, *to))
    }
}
