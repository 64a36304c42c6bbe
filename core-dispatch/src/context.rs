//! Thread requirements attached to continuations.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

use bridge_traits::host::{HostThread, HostThreadId};

thread_local! {
    static IN_WORKER_SCOPE: Cell<bool> = const { Cell::new(false) };
}

/// Shared reference to a designated host thread.
///
/// Two references are equal when they name the same thread.
#[derive(Clone)]
pub struct HostThreadRef(Arc<dyn HostThread>);

impl HostThreadRef {
    pub fn new(thread: Arc<dyn HostThread>) -> Self {
        Self(thread)
    }

    pub fn id(&self) -> HostThreadId {
        self.0.id()
    }

    /// Platform predicate: does the calling thread satisfy this affinity?
    pub fn is_current(&self) -> bool {
        self.0.is_current()
    }
}

impl PartialEq for HostThreadRef {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for HostThreadRef {}

impl fmt::Debug for HostThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostThreadRef").field(&self.id().as_str()).finish()
    }
}

impl<T: HostThread + 'static> From<Arc<T>> for HostThreadRef {
    fn from(thread: Arc<T>) -> Self {
        Self(thread)
    }
}

impl From<Arc<dyn HostThread>> for HostThreadRef {
    fn from(thread: Arc<dyn HostThread>) -> Self {
        Self(thread)
    }
}

/// Where a piece of work is allowed to run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ThreadContext {
    /// Must run on one specific designated host thread.
    Required(HostThreadRef),
    /// Runs wherever it happens to be resolved or submitted.
    Any,
    /// Must run on a dispatcher worker, off every designated thread.
    Worker,
}

impl ThreadContext {
    /// Whether the calling thread may run work for this context right now.
    pub fn is_satisfied(&self) -> bool {
        match self {
            ThreadContext::Required(thread) => thread.is_current(),
            ThreadContext::Any => true,
            ThreadContext::Worker => WorkerScope::is_active(),
        }
    }

    /// The designated thread, for `Required` contexts.
    pub fn thread(&self) -> Option<&HostThreadRef> {
        match self {
            ThreadContext::Required(thread) => Some(thread),
            _ => None,
        }
    }
}

impl fmt::Display for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadContext::Required(thread) => write!(f, "required({})", thread.id()),
            ThreadContext::Any => f.write_str("any"),
            ThreadContext::Worker => f.write_str("worker"),
        }
    }
}

/// Marks the current thread as executing dispatcher worker work until the
/// guard is dropped. Scopes nest.
pub(crate) struct WorkerScope {
    previous: bool,
}

impl WorkerScope {
    pub(crate) fn enter() -> Self {
        let previous = IN_WORKER_SCOPE.with(|flag| flag.replace(true));
        Self { previous }
    }

    pub(crate) fn is_active() -> bool {
        IN_WORKER_SCOPE.with(Cell::get)
    }
}

impl Drop for WorkerScope {
    fn drop(&mut self) {
        let previous = self.previous;
        IN_WORKER_SCOPE.with(|flag| flag.set(previous));
    }
}
