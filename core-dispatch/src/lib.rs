//! # Core Dispatch
//!
//! Lets asynchronous work run off the calling thread while the code that
//! consumes its result runs on the thread the host requires.
//!
//! ## Overview
//!
//! - [`ThreadContext`] - where a continuation may run (`Required(thread)`,
//!   `Any`, `Worker`)
//! - [`ThreadAffinityDispatcher`] - routes work to a context: inline when the
//!   caller already satisfies it, otherwise through a per-thread FIFO queue
//!   drained by that thread, or through the worker runtime
//! - [`FutureHandle`] - single-resolution, multi-observer result container
//!   whose handlers fire on their requested context
//! - [`SuspendToFutureBridge`] - turns async or blocking computations into
//!   `FutureHandle`s
//!
//! ## Usage
//!
//! ```rust
//! use core_dispatch::{SuspendToFutureBridge, ThreadAffinityDispatcher};
//! use bridge_traits::host::{BoundThread, HostThread};
//! use std::sync::{mpsc, Arc};
//!
//! let dispatcher = ThreadAffinityDispatcher::builder().worker_threads(1).build().unwrap();
//! let bridge = SuspendToFutureBridge::new(Arc::clone(&dispatcher));
//!
//! // This thread plays the host's primary thread.
//! let main = Arc::new(BoundThread::new("server-main"));
//! main.bind_current().unwrap();
//! let on_main = dispatcher.register_thread(Arc::clone(&main));
//!
//! let handle = bridge.invoke_blocking(|| Ok(21 * 2), on_main);
//! let (tx, rx) = mpsc::channel();
//! handle.on_success(move |answer| tx.send(answer).unwrap());
//!
//! // One host tick later the continuation has run here.
//! let answer = loop {
//!     dispatcher.drain(&main.id()).unwrap();
//!     if let Ok(answer) = rx.try_recv() {
//!         break answer;
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(1));
//! };
//! assert_eq!(answer, 42);
//! ```

pub mod bridge;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod handle;

pub use bridge::SuspendToFutureBridge;
pub use context::{HostThreadRef, ThreadContext};
pub use dispatcher::{DispatcherBuilder, ThreadAffinityDispatcher};
pub use error::{DispatchError, FetchError};
pub use handle::{FutureHandle, HandleState, Outcome};
