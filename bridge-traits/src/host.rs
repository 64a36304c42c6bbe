//! Designated host threads.
//!
//! A host platform usually owns one or more threads on which its state may
//! be touched (the "primary" or "main" thread). The dispatcher treats each of
//! them as an opaque [`HostThread`]: a stable identity used to select a work
//! queue, plus a predicate telling whether the calling thread is that thread.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use crate::error::{BridgeError, Result};

/// Stable identity of a designated host thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostThreadId(pub String);

impl HostThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Host-supplied affinity predicate for one designated thread.
///
/// # Platform Notes
///
/// - **Game servers**: the tick thread; `is_current` compares against the
///   server's own "is primary thread" check
/// - **UI toolkits**: the event-loop thread
/// - **Tests**: a [`BoundThread`] bound from inside a spawned thread
pub trait HostThread: Send + Sync {
    /// Identity used to route work to this thread's queue.
    fn id(&self) -> HostThreadId;

    /// Returns `true` when the calling thread is this designated thread.
    fn is_current(&self) -> bool;
}

impl<T: HostThread + ?Sized> HostThread for Arc<T> {
    fn id(&self) -> HostThreadId {
        (**self).id()
    }

    fn is_current(&self) -> bool {
        (**self).is_current()
    }
}

/// [`HostThread`] implementation that captures an OS thread identity the
/// first time [`bind_current`](BoundThread::bind_current) is called on it.
///
/// Clones share the binding.
#[derive(Clone)]
pub struct BoundThread {
    id: HostThreadId,
    bound: Arc<OnceLock<ThreadId>>,
}

impl BoundThread {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: HostThreadId::new(id),
            bound: Arc::new(OnceLock::new()),
        }
    }

    /// Binds this identity to the calling OS thread.
    ///
    /// Binding again from the same thread is a no-op; binding from a
    /// different thread fails.
    pub fn bind_current(&self) -> Result<()> {
        let current = thread::current().id();
        let bound = *self.bound.get_or_init(|| current);
        if bound == current {
            Ok(())
        } else {
            Err(BridgeError::AlreadyBound {
                thread: self.id.to_string(),
            })
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound.get().is_some()
    }
}

impl HostThread for BoundThread {
    fn id(&self) -> HostThreadId {
        self.id.clone()
    }

    fn is_current(&self) -> bool {
        self.bound.get() == Some(&thread::current().id())
    }
}

impl fmt::Debug for BoundThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundThread")
            .field("id", &self.id)
            .field("bound", &self.is_bound())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbound_thread_is_never_current() {
        let main = BoundThread::new("main");
        assert!(!main.is_bound());
        assert!(!main.is_current());
    }

    #[test]
    fn test_bind_current_is_idempotent_on_same_thread() {
        let main = BoundThread::new("main");
        main.bind_current().unwrap();
        main.bind_current().unwrap();
        assert!(main.is_current());
    }

    #[test]
    fn test_bind_from_other_thread_fails() {
        let main = BoundThread::new("main");
        main.bind_current().unwrap();

        let clone = main.clone();
        let result = thread::spawn(move || clone.bind_current()).join().unwrap();

        assert!(matches!(result, Err(BridgeError::AlreadyBound { .. })));
    }

    #[test]
    fn test_binding_is_shared_between_clones() {
        let main = BoundThread::new("main");
        let clone = main.clone();

        thread::spawn(move || {
            clone.bind_current().unwrap();
            assert!(clone.is_current());
        })
        .join()
        .unwrap();

        assert!(main.is_bound());
        assert!(!main.is_current());
        assert_eq!(main.id(), HostThreadId::new("main"));
    }
}
