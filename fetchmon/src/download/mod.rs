//! Resumable downloads with a bounded active set.
//!
//! # Architecture
//!
//! ```text
//! DownloadCoordinator
//!         │  owns: active set, waiting queue, removed set
//!         │
//!         ├── DownloadTask (one per download)
//!         │       ├── Status            lifecycle + transition table
//!         │       ├── ConnectionSource  immutable descriptor (HttpSource)
//!         │       │      └── Connection fresh per run
//!         │       ├── FileSink          resumable local writer
//!         │       └── ListenerSet       DownloadObserver fan-out
//!         │
//!         └── WaitingQueue  FIFO ranks of pending activation requests
//! ```
//!
//! # Example
//!
//! ```ignore
//! use fetchmon::config::CoordinatorConfig;
//! use fetchmon::download::{DownloadCoordinator, TracingObserver};
//! use std::sync::Arc;
//!
//! let coordinator = DownloadCoordinator::new(CoordinatorConfig::new("/tmp/downloads"));
//! coordinator.add_observer(Arc::new(TracingObserver));
//!
//! let task = coordinator.add_url("https://example.com/file.iso")?;
//! task.download();
//! ```

mod connection;
mod coordinator;
mod error;
mod events;
mod http;
mod queue;
mod sink;
mod status;
mod task;

pub use connection::{Connection, ConnectionError, ConnectionResult, ConnectionSource};
pub use coordinator::DownloadCoordinator;
pub use error::{CoordinatorError, CoordinatorResult, TransferError, TransferResult};
pub use events::{DownloadEvent, DownloadObserver, ListenerSet, TracingObserver};
pub use http::{
    file_name_from_url, parse_content_range_total, HttpConnection, HttpSource,
    FALLBACK_FILE_NAME,
};
pub use queue::WaitingQueue;
pub use sink::{disambiguate, probe_length, ExistsPolicy, FileSink, SinkError, SinkResult};
pub use status::{transition, Status, StatusKind};
pub use task::{DownloadId, DownloadSnapshot, DownloadTask};
