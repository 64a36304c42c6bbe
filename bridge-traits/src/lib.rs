//! # Host Bridge Traits
//!
//! Contracts between the dispatch core and the host platform it is embedded
//! in.
//!
//! ## Overview
//!
//! The core never asks "which thread is this?" directly. Each host supplies
//! a [`HostThread`](host::HostThread) per designated thread (a game server's
//! primary thread, a UI thread, a region thread) and the dispatcher only
//! evaluates its `is_current()` predicate. Everything else the core needs
//! from the host is time and log forwarding.
//!
//! ## Traits
//!
//! - [`HostThread`](host::HostThread) - Identity + "current thread satisfies
//!   affinity" predicate for a designated thread
//! - [`Clock`](time::Clock) - Time source for cache expiry and deterministic tests
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync`: the dispatcher evaluates
//! `HostThread::is_current()` from whichever thread submits work.
//!
//! ## Example
//!
//! ```rust
//! use bridge_traits::host::{BoundThread, HostThread};
//!
//! let main = BoundThread::new("server-main");
//! main.bind_current().unwrap();
//! assert!(main.is_current());
//!
//! let other = std::thread::spawn({
//!     let main = main.clone();
//!     move || main.is_current()
//! });
//! assert!(!other.join().unwrap());
//! ```

pub mod error;
pub mod host;
pub mod time;

pub use error::BridgeError;

pub use host::{BoundThread, HostThread, HostThreadId};
pub use time::{Clock, ConsoleLogger, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
