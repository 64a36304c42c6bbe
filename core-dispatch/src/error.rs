use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Failure delivered to the observers of a [`FutureHandle`](crate::FutureHandle).
///
/// Every observer of one handle receives a clone of the same value; the
/// `Failed` payload is shared behind an `Arc`, so "the exact error the
/// fetcher produced" is observable through [`FetchError::source_error`].
#[derive(Error, Clone)]
pub enum FetchError {
    /// The computation itself failed.
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),

    /// The dispatcher was shut down before the outcome could be delivered on
    /// the required thread.
    #[error("Dispatcher is closed")]
    DispatcherClosed,

    /// The computation panicked; the payload is rendered as text.
    #[error("Computation panicked: {0}")]
    Panicked(String),

    /// No outcome arrived within the allotted time.
    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    /// The handle was cancelled before it settled.
    #[error("Cancelled")]
    Cancelled,
}

impl FetchError {
    /// Wraps any error as a [`FetchError::Failed`].
    pub fn failed<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        FetchError::Failed(Arc::new(error.into()))
    }

    /// The underlying error for `Failed`, `None` otherwise.
    pub fn source_error(&self) -> Option<&anyhow::Error> {
        match self {
            FetchError::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// `true` when two values carry the very same failure (same `Arc`
    /// allocation for `Failed`, equal variants otherwise).
    pub fn same_failure(&self, other: &FetchError) -> bool {
        match (self, other) {
            (FetchError::Failed(a), FetchError::Failed(b)) => Arc::ptr_eq(a, b),
            (FetchError::Panicked(a), FetchError::Panicked(b)) => a == b,
            (FetchError::TimedOut(a), FetchError::TimedOut(b)) => a == b,
            (FetchError::DispatcherClosed, FetchError::DispatcherClosed)
            | (FetchError::Cancelled, FetchError::Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Failed(error) => f.debug_tuple("Failed").field(&format!("{error:#}")).finish(),
            FetchError::DispatcherClosed => f.write_str("DispatcherClosed"),
            FetchError::Panicked(message) => f.debug_tuple("Panicked").field(message).finish(),
            FetchError::TimedOut(after) => f.debug_tuple("TimedOut").field(after).finish(),
            FetchError::Cancelled => f.write_str("Cancelled"),
        }
    }
}

impl From<anyhow::Error> for FetchError {
    fn from(error: anyhow::Error) -> Self {
        FetchError::Failed(Arc::new(error))
    }
}

/// Errors returned by [`ThreadAffinityDispatcher`](crate::ThreadAffinityDispatcher)
/// operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Dispatcher is closed")]
    Closed,

    #[error("Thread '{0}' is not registered with the dispatcher")]
    UnknownThread(String),

    #[error("Queue for thread '{expected}' can only be drained from that thread")]
    WrongThread { expected: String },

    #[error("Worker runtime unavailable: {0}")]
    Runtime(String),
}

impl From<std::io::Error> for DispatchError {
    fn from(error: std::io::Error) -> Self {
        DispatchError::Runtime(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("IOError: {0}")]
    struct IoFailure(&'static str);

    #[test]
    fn test_failed_preserves_source() {
        let error = FetchError::failed(IoFailure("timeout"));
        let source = error.source_error().unwrap();
        assert_eq!(source.to_string(), "IOError: timeout");
        assert!(source.downcast_ref::<IoFailure>().is_some());
        assert_eq!(error.to_string(), "IOError: timeout");
    }

    #[test]
    fn test_clones_are_the_same_failure() {
        let error = FetchError::failed(IoFailure("timeout"));
        let clone = error.clone();
        assert!(error.same_failure(&clone));

        let other = FetchError::failed(IoFailure("timeout"));
        assert!(!error.same_failure(&other));
    }

    #[test]
    fn test_non_failed_variants() {
        assert!(FetchError::Cancelled.source_error().is_none());
        assert!(FetchError::DispatcherClosed.same_failure(&FetchError::DispatcherClosed));
        assert!(!FetchError::DispatcherClosed.same_failure(&FetchError::Cancelled));
        assert_eq!(
            FetchError::TimedOut(Duration::from_millis(5)).to_string(),
            "Timed out after 5ms"
        );
    }

    #[test]
    fn test_dispatch_error_display() {
        let error = DispatchError::WrongThread {
            expected: "server-main".to_string(),
        };
        assert!(error.to_string().contains("server-main"));
        assert_eq!(
            DispatchError::UnknownThread("region-1".into()).to_string(),
            "Thread 'region-1' is not registered with the dispatcher"
        );
    }
}
