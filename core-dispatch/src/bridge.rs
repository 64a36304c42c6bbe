//! # Suspend-to-Future Bridge
//!
//! Turns an async computation into a [`FutureHandle`] a synchronous caller
//! can attach continuations to.
//!
//! The computation is polled once on the calling thread; a computation that
//! never suspends settles immediately. Otherwise the rest of it moves to the
//! dispatcher's worker runtime. Either way the outcome is stored by a job
//! submitted to the handle's resume context, so continuations observe it on
//! the thread they require.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;

use core_async::time::sleep;
use futures::task::noop_waker;
use futures::FutureExt;
use tracing::{debug, trace};

use crate::context::ThreadContext;
use crate::dispatcher::{panic_message, ThreadAffinityDispatcher};
use crate::error::FetchError;
use crate::handle::{deliver, FutureHandle, Outcome};

type Computation<T> = Pin<Box<dyn Future<Output = thread::Result<Outcome<T>>> + Send>>;

fn flatten<T>(result: thread::Result<Outcome<T>>) -> Outcome<T> {
    result.unwrap_or_else(|payload| Err(FetchError::Panicked(panic_message(payload.as_ref()))))
}

/// Carries a handle through an in-flight computation.
///
/// Dropped without completing (the worker runtime shut down under it), it
/// settles the handle with `DispatcherClosed`.
struct Settlement<T: Clone + Send + 'static> {
    handle: Option<FutureHandle<T>>,
}

impl<T: Clone + Send + 'static> Settlement<T> {
    fn new(handle: FutureHandle<T>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Stores `outcome` from the handle's resume context.
    fn complete(mut self, outcome: Outcome<T>) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let context = handle.context().clone();
        let dispatcher = Arc::clone(handle.dispatcher());
        deliver(
            &dispatcher,
            &context,
            Box::new(move |outcome| {
                handle.resolve(outcome);
            }),
            outcome,
        );
    }
}

impl<T: Clone + Send + 'static> Drop for Settlement<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            trace!("Computation abandoned; settling with DispatcherClosed");
            handle.resolve(Err(FetchError::DispatcherClosed));
        }
    }
}

/// Adapts async and blocking computations to [`FutureHandle`]s.
#[derive(Clone, Debug)]
pub struct SuspendToFutureBridge {
    dispatcher: Arc<ThreadAffinityDispatcher>,
}

impl SuspendToFutureBridge {
    pub fn new(dispatcher: Arc<ThreadAffinityDispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<ThreadAffinityDispatcher> {
        &self.dispatcher
    }

    /// A fresh pending handle resuming on `context`.
    pub fn handle<T: Clone + Send + 'static>(&self, context: ThreadContext) -> FutureHandle<T> {
        FutureHandle::new(Arc::clone(&self.dispatcher), context)
    }

    /// Starts `computation` and returns a handle settled with its outcome on
    /// `resume`.
    pub fn invoke<T, Fut>(&self, computation: Fut, resume: ThreadContext) -> FutureHandle<T>
    where
        T: Clone + Send + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let handle = self.handle(resume);
        self.invoke_into(&handle, computation);
        handle
    }

    /// Starts `computation` and settles the existing `handle` with it.
    pub fn invoke_into<T, Fut>(&self, handle: &FutureHandle<T>, computation: Fut)
    where
        T: Clone + Send + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let settlement = Settlement::new(handle.clone());
        if self.dispatcher.is_closed() {
            settlement.complete(Err(FetchError::DispatcherClosed));
            return;
        }

        let runtime = self.dispatcher.worker_runtime();
        let mut computation: Computation<T> = Box::pin(AssertUnwindSafe(computation).catch_unwind());

        // Timers and I/O created during the first poll register with the
        // worker runtime, which owns the rest of the computation.
        let first_poll = {
            let _enter = runtime.enter();
            let waker = noop_waker();
            let mut cx = Context::from_waker(&waker);
            computation.as_mut().poll(&mut cx)
        };

        match first_poll {
            Poll::Ready(result) => settlement.complete(flatten(result)),
            Poll::Pending => {
                trace!("Computation suspended; continuing on worker runtime");
                drop(runtime.spawn(async move {
                    let result = computation.await;
                    settlement.complete(flatten(result));
                }));
            }
        }
    }

    /// Runs a synchronous computation on the worker context and returns a
    /// handle settled with its outcome on `resume`.
    pub fn invoke_blocking<T, F>(&self, computation: F, resume: ThreadContext) -> FutureHandle<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        let handle = self.handle(resume);
        self.invoke_blocking_into(&handle, computation);
        handle
    }

    pub fn invoke_blocking_into<T, F>(&self, handle: &FutureHandle<T>, computation: F)
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        let settlement = Settlement::new(handle.clone());
        let work = move || {
            let outcome = flatten(panic::catch_unwind(AssertUnwindSafe(computation)));
            settlement.complete(outcome);
        };
        if let Err(error) = self.dispatcher.submit(&ThreadContext::Worker, work) {
            debug!(%error, "Blocking computation refused");
        }
    }

    /// A derived handle that fails with [`FetchError::TimedOut`] unless
    /// `handle` settles within `duration`. `handle` itself is unaffected.
    pub fn with_timeout<T>(&self, handle: &FutureHandle<T>, duration: Duration) -> FutureHandle<T>
    where
        T: Clone + Send + 'static,
    {
        let derived = handle.subscribe(handle.context().clone());
        if self.dispatcher.is_closed() {
            return derived;
        }

        let timer = derived.clone();
        drop(self.dispatcher.worker_runtime().spawn(async move {
            sleep(duration).await;
            if timer.settle(Err(FetchError::TimedOut(duration)), false) {
                debug!(?duration, "Handle timed out");
            }
        }));
        derived
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn bridge() -> SuspendToFutureBridge {
        let dispatcher = ThreadAffinityDispatcher::builder()
            .worker_threads(2)
            .thread_name_prefix("bridge-test")
            .build()
            .unwrap();
        SuspendToFutureBridge::new(dispatcher)
    }

    #[test]
    fn test_ready_computation_settles_before_returning() {
        let bridge = bridge();
        let handle = bridge.invoke(async { Ok::<_, FetchError>(5) }, ThreadContext::Any);
        assert_eq!(handle.peek().unwrap().unwrap(), 5);
    }

    #[test]
    fn test_suspended_computation_continues_on_worker_runtime() {
        let bridge = bridge();
        let handle = bridge.invoke(
            async {
                sleep(Duration::from_millis(20)).await;
                Ok(thread::current().name().map(str::to_string))
            },
            ThreadContext::Any,
        );
        assert_eq!(handle.state(), HandleState::Pending);

        let (tx, rx) = mpsc::channel();
        handle.on_complete(move |outcome| tx.send(outcome).unwrap());
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(name.unwrap().starts_with("bridge-test-"));
    }

    async fn explode() -> Outcome<u8> {
        panic!("fetcher blew up")
    }

    #[test]
    fn test_panicking_computation_settles_as_panicked() {
        let bridge = bridge();
        let handle = bridge.invoke(explode(), ThreadContext::Any);
        match handle.peek() {
            Some(Err(FetchError::Panicked(message))) => assert_eq!(message, "fetcher blew up"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_blocking_computation_runs_on_worker() {
        let bridge = bridge();
        let caller = thread::current().id();
        let handle = bridge.invoke_blocking(
            move || Ok(thread::current().id() != caller && ThreadContext::Worker.is_satisfied()),
            ThreadContext::Any,
        );

        let (tx, rx) = mpsc::channel();
        handle.on_success(move |off_thread| tx.send(off_thread).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_invoke_after_shutdown_is_dispatcher_closed() {
        let bridge = bridge();
        bridge.dispatcher().shutdown();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);

        let handle = bridge.invoke(
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            },
            ThreadContext::Any,
        );

        assert!(matches!(handle.peek(), Some(Err(FetchError::DispatcherClosed))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let blocking: FutureHandle<u8> = bridge.invoke_blocking(|| Ok(1), ThreadContext::Any);
        assert!(matches!(blocking.peek(), Some(Err(FetchError::DispatcherClosed))));
    }

    #[test]
    fn test_timeout_fails_derived_handle_only() {
        let bridge = bridge();
        let slow: FutureHandle<u8> = bridge.handle(ThreadContext::Any);
        let bounded = bridge.with_timeout(&slow, Duration::from_millis(10));

        let (tx, rx) = mpsc::channel();
        bounded.on_failure(move |error| tx.send(error).unwrap());
        let error = rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(matches!(error, FetchError::TimedOut(after) if after == Duration::from_millis(10)));
        assert_eq!(slow.state(), HandleState::Pending);
        assert!(slow.resolve(Ok(1)));
    }

    #[test]
    fn test_timeout_does_not_fire_after_settlement() {
        let bridge = bridge();
        let fast = bridge.handle(ThreadContext::Any);
        let bounded = bridge.with_timeout(&fast, Duration::from_millis(10));

        fast.resolve(Ok(9));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(bounded.peek().unwrap().unwrap(), 9);
    }
}
