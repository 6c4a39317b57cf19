//! fetchmon - resumable, queued file downloads
//!
//! This library manages downloads that can be paused, resumed, stopped and
//! removed, while a coordinator keeps the number of concurrent transfers
//! below a configured limit and admits waiting downloads in request order.
//!
//! - [`download`]: lifecycle, run loop, coordinator and transports
//! - [`config`]: runtime and persisted configuration
//! - [`logging`]: tracing subscriber setup

pub mod config;
pub mod download;
pub mod logging;
