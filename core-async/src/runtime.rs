//! Runtime utilities that abstract over the underlying async executor.
//!
//! [`WorkerRuntime`] is the executor behind the dispatcher's `Worker`
//! context. It is owned explicitly (never a process-wide global) and can be
//! shut down from any thread, including from inside another runtime, without
//! blocking.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub use tokio::runtime::{Builder, EnterGuard, Handle, Runtime};

use crate::task::JoinHandle;

/// Runs the provided future to completion using a lightweight runtime.
///
/// # Panics
///
/// Panics when the runtime cannot be built or when called from inside an
/// async context.
pub fn block_on<F>(future: F) -> F::Output
where
    F: Future,
{
    Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("core_async::runtime::block_on: failed to build Tokio runtime")
        .block_on(future)
}

/// Multi-threaded runtime dedicated to off-thread work.
///
/// Worker threads are named `{prefix}-{n}` so that thread-aware logging
/// shows where a continuation actually ran.
pub struct WorkerRuntime {
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
}

impl WorkerRuntime {
    /// Builds a runtime with `threads` async workers and an equally sized
    /// blocking pool.
    pub fn new(threads: usize, prefix: impl Into<String>) -> io::Result<Self> {
        let prefix: String = prefix.into();
        let counter = Arc::new(AtomicUsize::new(0));
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .max_blocking_threads(threads.max(1))
            .thread_name_fn(move || {
                let id = counter.fetch_add(1, Ordering::Relaxed);
                format!("{prefix}-{id}")
            })
            .enable_all()
            .build()?;

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// Handle usable from any thread to spawn onto this runtime.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawns a future on the worker runtime.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Runs synchronous work on the worker runtime's blocking pool.
    pub fn spawn_blocking<F, R>(&self, work: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.spawn_blocking(work)
    }

    /// Enters the runtime context on the calling thread so that timers and
    /// I/O resources can be created while polling outside a worker.
    pub fn enter(&self) -> EnterGuard<'_> {
        self.handle.enter()
    }

    /// Blocks the calling thread on `future`. Must not be called from inside
    /// an async context.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.runtime
            .lock()
            .map(|guard| guard.is_none())
            .unwrap_or(true)
    }

    /// Shuts the runtime down without waiting for running tasks. Idempotent.
    pub fn shutdown(&self) {
        let runtime = match self.runtime.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

impl Drop for WorkerRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
