//! Async runtime abstraction for the affinity bridge.
//!
//! Every other crate in the workspace reaches Tokio through this crate so the
//! executor choice stays in one place. The dispatcher owns a dedicated worker
//! runtime (see [`runtime::WorkerRuntime`]) for computations that must run off
//! the host's designated thread; everything else here is a thin re-export.
//!
//! # Modules
//!
//! - `task`: Task spawning and execution
//! - `runtime`: Worker runtime construction and `block_on`
//! - `time`: Sleep, timeout and instants
//! - `sync`: Async-aware channels and cancellation
//!
//! # Examples
//!
//! ```rust
//! use core_async::runtime::WorkerRuntime;
//! use core_async::time::{sleep, Duration};
//!
//! let workers = WorkerRuntime::new(2, "doc-worker").unwrap();
//! let value = workers.block_on(async {
//!     sleep(Duration::from_millis(1)).await;
//!     42
//! });
//! assert_eq!(value, 42);
//! workers.shutdown();
//! ```

pub mod runtime;
pub mod sync;
pub mod task;
pub mod time;

pub use task::spawn;
pub use time::{sleep, Duration, Instant};
