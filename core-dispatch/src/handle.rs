//! # Single-Resolution Future Handles
//!
//! A [`FutureHandle`] is the synchronous caller's view of an outcome that
//! will be produced elsewhere. It settles once; every handler registered on
//! it fires at most once (exactly once unless the handle is cancelled), on
//! the thread its [`ThreadContext`] names.
//!
//! Handlers are never run while the handle's lock is held. Each one is
//! handed to [`ThreadAffinityDispatcher::submit`]; if the dispatcher refuses
//! the work, the handler still runs, inline, with
//! [`FetchError::DispatcherClosed`].

use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use core_async::sync::oneshot;
use tracing::{debug, error, trace, warn};

use crate::context::ThreadContext;
use crate::dispatcher::{lock, panic_message, ThreadAffinityDispatcher};
use crate::error::FetchError;

/// Outcome stored in and delivered by a [`FutureHandle`].
pub type Outcome<T> = Result<T, FetchError>;

pub(crate) type Handler<T> = Box<dyn FnOnce(Outcome<T>) + Send + 'static>;

/// Observable lifecycle of a [`FutureHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Pending,
    Resolved,
    Cancelled,
}

struct Registration<T> {
    context: ThreadContext,
    handler: Handler<T>,
}

enum State<T> {
    Pending(Vec<Registration<T>>),
    Resolved(Outcome<T>),
    Cancelled,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    dispatcher: Arc<ThreadAffinityDispatcher>,
    context: ThreadContext,
}

/// A handler paired with the outcome it should receive.
///
/// Dropped without running (a queue discarded at shutdown, a submission the
/// dispatcher refused), it hands the handler `DispatcherClosed` instead.
pub(crate) struct Delivery<T> {
    handler: Option<Handler<T>>,
    outcome: Option<Outcome<T>>,
}

impl<T> Delivery<T> {
    pub(crate) fn new(handler: Handler<T>, outcome: Outcome<T>) -> Self {
        Self {
            handler: Some(handler),
            outcome: Some(outcome),
        }
    }

    pub(crate) fn run(mut self) {
        if let (Some(handler), Some(outcome)) = (self.handler.take(), self.outcome.take()) {
            handler(outcome);
        }
    }
}

impl<T> Drop for Delivery<T> {
    fn drop(&mut self) {
        let Some(handler) = self.handler.take() else {
            return;
        };
        trace!("Delivering DispatcherClosed inline");
        if let Err(payload) =
            panic::catch_unwind(AssertUnwindSafe(|| handler(Err(FetchError::DispatcherClosed))))
        {
            error!(
                panic = %panic_message(payload.as_ref()),
                "Handler panicked while receiving DispatcherClosed"
            );
        }
    }
}

/// Submits `handler(outcome)` to `context`.
pub(crate) fn deliver<T: Send + 'static>(
    dispatcher: &ThreadAffinityDispatcher,
    context: &ThreadContext,
    handler: Handler<T>,
    outcome: Outcome<T>,
) {
    let delivery = Delivery::new(handler, outcome);
    if let Err(error) = dispatcher.submit(context, move || delivery.run()) {
        debug!(context = %context, %error, "Submission refused; handler completed inline");
    }
}

/// Settles a derived handle with its parent's outcome; cancels it if the
/// parent drops the link unsettled.
struct ChildLink<T: Clone + Send + 'static> {
    child: Option<FutureHandle<T>>,
}

impl<T: Clone + Send + 'static> ChildLink<T> {
    fn settle(mut self, outcome: Outcome<T>) {
        if let Some(child) = self.child.take() {
            child.settle(outcome, false);
        }
    }
}

impl<T: Clone + Send + 'static> Drop for ChildLink<T> {
    fn drop(&mut self) {
        if let Some(child) = self.child.take() {
            child.cancel();
        }
    }
}

/// One-shot, multi-observer result container.
///
/// Clones share the same state.
///
/// # Example
///
/// ```rust
/// use core_dispatch::{FutureHandle, ThreadAffinityDispatcher, ThreadContext};
/// use std::sync::mpsc;
///
/// let dispatcher = ThreadAffinityDispatcher::builder().worker_threads(1).build().unwrap();
/// let handle: FutureHandle<u32> = FutureHandle::new(dispatcher, ThreadContext::Any);
///
/// let (tx, rx) = mpsc::channel();
/// handle.on_success(move |value| tx.send(value).unwrap());
/// assert!(handle.resolve(Ok(7)));
/// assert_eq!(rx.recv().unwrap(), 7);
/// ```
pub struct FutureHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for FutureHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> FutureHandle<T> {
    /// A pending handle whose handlers default to `context`.
    pub fn new(dispatcher: Arc<ThreadAffinityDispatcher>, context: ThreadContext) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending(Vec::new())),
                dispatcher,
                context,
            }),
        }
    }

    /// A handle that is already settled with `outcome`.
    pub fn resolved(
        dispatcher: Arc<ThreadAffinityDispatcher>,
        context: ThreadContext,
        outcome: Outcome<T>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Resolved(outcome)),
                dispatcher,
                context,
            }),
        }
    }

    /// Default context for handlers registered without one.
    pub fn context(&self) -> &ThreadContext {
        &self.shared.context
    }

    pub fn dispatcher(&self) -> &Arc<ThreadAffinityDispatcher> {
        &self.shared.dispatcher
    }

    pub fn state(&self) -> HandleState {
        match &*lock(&self.shared.state) {
            State::Pending(_) => HandleState::Pending,
            State::Resolved(_) => HandleState::Resolved,
            State::Cancelled => HandleState::Cancelled,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == HandleState::Pending
    }

    /// The stored outcome, if resolved.
    pub fn peek(&self) -> Option<Outcome<T>> {
        match &*lock(&self.shared.state) {
            State::Resolved(outcome) => Some(outcome.clone()),
            _ => None,
        }
    }

    /// `true` when both handles share state.
    pub fn ptr_eq(&self, other: &FutureHandle<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Settles the handle. The first call wins and returns `true`; later
    /// calls are ignored (logged as a double resolution) and return `false`.
    pub fn resolve(&self, outcome: Outcome<T>) -> bool {
        self.settle(outcome, true)
    }

    pub fn succeed(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    pub fn fail(&self, error: FetchError) -> bool {
        self.resolve(Err(error))
    }

    pub(crate) fn settle(&self, outcome: Outcome<T>, report_repeat: bool) -> bool {
        let registrations = {
            let mut state = lock(&self.shared.state);
            match &mut *state {
                State::Pending(registrations) => {
                    let registrations = mem::take(registrations);
                    *state = State::Resolved(outcome.clone());
                    registrations
                }
                State::Resolved(_) => {
                    if report_repeat {
                        warn!(
                            context = %self.shared.context,
                            "DoubleResolution: handle already resolved, ignoring"
                        );
                    }
                    return false;
                }
                State::Cancelled => {
                    trace!("Resolution of a cancelled handle dropped");
                    return false;
                }
            }
        };

        for Registration { context, handler } in registrations {
            deliver(&self.shared.dispatcher, &context, handler, outcome.clone());
        }
        true
    }

    /// Cancels a pending handle: every registered handler is dropped and
    /// never runs, now or later. Returns `false` if already settled.
    pub fn cancel(&self) -> bool {
        let dropped = {
            let mut state = lock(&self.shared.state);
            match &mut *state {
                State::Pending(registrations) => {
                    let registrations = mem::take(registrations);
                    *state = State::Cancelled;
                    registrations
                }
                _ => return false,
            }
        };
        debug!(handlers = dropped.len(), "Handle cancelled");
        drop(dropped);
        true
    }

    fn register(&self, context: ThreadContext, handler: Handler<T>) {
        let ready = {
            let mut state = lock(&self.shared.state);
            match &mut *state {
                State::Pending(registrations) => {
                    registrations.push(Registration { context, handler });
                    return;
                }
                State::Resolved(outcome) => outcome.clone(),
                State::Cancelled => {
                    trace!("Handler registered on a cancelled handle dropped");
                    return;
                }
            }
        };
        deliver(&self.shared.dispatcher, &context, handler, ready);
    }

    /// Registers `handler` for the outcome, on the handle's default context.
    pub fn on_complete<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.on_complete_in(self.shared.context.clone(), handler)
    }

    pub fn on_complete_in<F>(&self, context: ThreadContext, handler: F) -> &Self
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.register(context, Box::new(handler));
        self
    }

    /// Registers `handler` for a successful outcome.
    pub fn on_success<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.on_success_in(self.shared.context.clone(), handler)
    }

    pub fn on_success_in<F>(&self, context: ThreadContext, handler: F) -> &Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.on_complete_in(context, move |outcome| {
            if let Ok(value) = outcome {
                handler(value);
            }
        })
    }

    /// Registers `handler` for a failed outcome.
    pub fn on_failure<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(FetchError) + Send + 'static,
    {
        self.on_failure_in(self.shared.context.clone(), handler)
    }

    pub fn on_failure_in<F>(&self, context: ThreadContext, handler: F) -> &Self
    where
        F: FnOnce(FetchError) + Send + 'static,
    {
        self.on_complete_in(context, move |outcome| {
            if let Err(error) = outcome {
                handler(error);
            }
        })
    }

    /// A derived handle that settles with this handle's outcome.
    ///
    /// Cancelling the derived handle leaves this one and its other
    /// subscribers untouched; cancelling this one cancels the derived handle.
    pub fn subscribe(&self, context: ThreadContext) -> FutureHandle<T> {
        let child = FutureHandle::new(Arc::clone(&self.shared.dispatcher), context);
        let link = ChildLink {
            child: Some(child.clone()),
        };
        self.register(ThreadContext::Any, Box::new(move |outcome| link.settle(outcome)));
        child
    }

    /// Waits for the outcome from async code.
    ///
    /// Resolves to [`FetchError::Cancelled`] if the handle is cancelled
    /// first.
    pub async fn outcome(&self) -> Outcome<T> {
        let (tx, rx) = oneshot::channel();
        self.on_complete_in(ThreadContext::Any, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.unwrap_or(Err(FetchError::Cancelled))
    }
}

impl<T> fmt::Debug for FutureHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*lock(&self.shared.state) {
            State::Pending(registrations) => format!("Pending({} handlers)", registrations.len()),
            State::Resolved(Ok(_)) => "Resolved(Ok)".to_string(),
            State::Resolved(Err(error)) => format!("Resolved(Err({error}))"),
            State::Cancelled => "Cancelled".to_string(),
        };
        f.debug_struct("FutureHandle")
            .field("context", &self.shared.context)
            .field("state", &state)
            .finish()
    }
}
