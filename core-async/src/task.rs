//! Task spawning and execution abstractions.
//!
//! - `spawn`: schedules a future on the ambient Tokio runtime
//! - `spawn_blocking`: runs synchronous work on the blocking pool
//!
//! Tasks must be `Send + 'static`; they may run on any worker thread.
//!
//! # Examples
//!
//! ```rust
//! use core_async::task;
//!
//! # async fn example() {
//! let handle = task::spawn(async { 42 });
//! assert_eq!(handle.await.unwrap(), 42);
//! # }
//! ```

pub use tokio::task::{spawn_blocking, yield_now, AbortHandle, JoinError, JoinHandle};

/// Spawns a new asynchronous task on the current Tokio runtime.
///
/// # Panics
///
/// Panics when called outside a runtime context; use
/// [`WorkerRuntime::spawn`](crate::runtime::WorkerRuntime::spawn) from
/// plain threads.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::task::spawn(future)
}

/// Result type for task operations.
pub type Result<T> = std::result::Result<T, JoinError>;
