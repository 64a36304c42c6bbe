//! Synchronization primitives.
//!
//! The `tokio::sync` channels the dispatcher, handles and event bus are
//! built on, plus `tokio_util`'s cancellation token. Short, non-awaiting
//! critical sections keep using `std::sync::Mutex`.
//!
//! # Examples
//!
//! ```rust
//! use core_async::sync::oneshot;
//!
//! # async fn example() {
//! let (tx, rx) = oneshot::channel();
//! tx.send(7).unwrap();
//! assert_eq!(rx.await.unwrap(), 7);
//! # }
//! ```

pub use tokio::sync::{broadcast, mpsc, oneshot};

pub use tokio_util::sync::CancellationToken;
