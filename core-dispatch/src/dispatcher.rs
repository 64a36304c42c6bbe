//! # Thread-Affinity Dispatcher
//!
//! Routes work to the thread it must run on.
//!
//! ```text
//!                 submit(ctx, work)
//!                        │
//!          ctx satisfied by caller? ──yes──> run inline
//!                        │ no
//!        ┌───────────────┴────────────────┐
//!   Required(t)                         Worker
//!        │                                │
//!  ContextQueue(t)                 unbounded channel
//!  drained by t each tick          pump task ─> blocking pool
//! ```
//!
//! Every item runs behind `catch_unwind`; a panicking handler is logged,
//! published on the [`EventBus`] and the queue keeps draining.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use bridge_traits::host::HostThreadId;
use core_async::runtime::WorkerRuntime;
use core_async::sync::mpsc;
use core_async::task;
use core_runtime::config::CoreConfig;
use core_runtime::events::{DispatchEvent, EventBus, RuntimeEvent};
use tracing::{debug, error, info, trace};

use crate::context::{HostThreadRef, ThreadContext, WorkerScope};
use crate::error::DispatchError;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Renders a caught panic payload as text.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs one work item, containing any panic at this boundary.
fn run_guarded(context: &ThreadContext, job: Job, event_bus: Option<&EventBus>) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        let message = panic_message(payload.as_ref());
        error!(context = %context, panic = %message, "Handler panicked; continuing");
        if let Some(bus) = event_bus {
            let _ = bus.emit(RuntimeEvent::Dispatch(DispatchEvent::HandlerPanicked {
                context: context.to_string(),
                message,
            }));
        }
    }
}

/// FIFO of work waiting for one designated thread.
struct ContextQueue {
    thread: HostThreadRef,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    closed: bool,
}

impl ContextQueue {
    fn new(thread: HostThreadRef) -> Self {
        Self {
            thread,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Hands the job back when the queue is closed so the caller can drop it
    /// outside the lock.
    fn push(&self, job: Job) -> Result<(), Job> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(job);
        }
        state.jobs.push_back(job);
        Ok(())
    }

    fn take_all(&self) -> VecDeque<Job> {
        std::mem::take(&mut lock(&self.state).jobs)
    }

    fn close(&self) -> VecDeque<Job> {
        let mut state = lock(&self.state);
        state.closed = true;
        std::mem::take(&mut state.jobs)
    }

    fn len(&self) -> usize {
        lock(&self.state).jobs.len()
    }
}

/// Builder for [`ThreadAffinityDispatcher`].
#[derive(Clone)]
pub struct DispatcherBuilder {
    worker_threads: usize,
    thread_name_prefix: String,
    event_bus: Option<EventBus>,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            thread_name_prefix: "affinity-worker".to_string(),
            event_bus: None,
        }
    }
}

impl DispatcherBuilder {
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Publish handler panics and closure on `bus`.
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Starts the worker runtime and its pump task.
    pub fn build(self) -> Result<Arc<ThreadAffinityDispatcher>, DispatchError> {
        let runtime = WorkerRuntime::new(self.worker_threads, self.thread_name_prefix.clone())?;
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let worker_backlog = Arc::new(AtomicUsize::new(0));

        drop(runtime.spawn(pump(
            worker_rx,
            Arc::clone(&worker_backlog),
            self.event_bus.clone(),
        )));

        debug!(
            worker_threads = self.worker_threads,
            prefix = %self.thread_name_prefix,
            "Dispatcher started"
        );

        Ok(Arc::new(ThreadAffinityDispatcher {
            queues: RwLock::new(HashMap::new()),
            worker_tx: Mutex::new(Some(worker_tx)),
            worker_backlog,
            runtime,
            closed: AtomicBool::new(false),
            event_bus: self.event_bus,
        }))
    }
}

/// Consumes `Worker` submissions in order, starting each on the blocking
/// pool.
async fn pump(
    mut worker_rx: mpsc::UnboundedReceiver<Job>,
    backlog: Arc<AtomicUsize>,
    event_bus: Option<EventBus>,
) {
    while let Some(job) = worker_rx.recv().await {
        let _ = backlog.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            Some(n.saturating_sub(1))
        });
        let event_bus = event_bus.clone();
        drop(task::spawn_blocking(move || {
            let _scope = WorkerScope::enter();
            run_guarded(&ThreadContext::Worker, job, event_bus.as_ref());
        }));
    }
    trace!("Worker pump stopped");
}

/// Routes work to the thread its [`ThreadContext`] requires.
///
/// Submission never blocks. Work for a designated thread waits in that
/// thread's FIFO queue until the thread calls [`drain`](Self::drain); work
/// for [`ThreadContext::Worker`] runs on the dispatcher's own worker runtime.
pub struct ThreadAffinityDispatcher {
    queues: RwLock<HashMap<HostThreadId, Arc<ContextQueue>>>,
    worker_tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker_backlog: Arc<AtomicUsize>,
    runtime: WorkerRuntime,
    closed: AtomicBool,
    event_bus: Option<EventBus>,
}

impl ThreadAffinityDispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Builder seeded with the worker settings of `config`.
    pub fn from_config(config: &CoreConfig) -> DispatcherBuilder {
        DispatcherBuilder::default()
            .worker_threads(config.worker_threads)
            .thread_name_prefix(config.thread_name_prefix.clone())
    }

    /// Registers a designated thread and returns the context that targets it.
    ///
    /// Registering an id twice keeps the first registration and its queue.
    pub fn register_thread(&self, thread: impl Into<HostThreadRef>) -> ThreadContext {
        let thread = thread.into();
        let id = thread.id();
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        let queue = queues
            .entry(id.clone())
            .or_insert_with(|| {
                debug!(thread = %id, "Registered designated thread");
                Arc::new(ContextQueue::new(thread))
            });
        ThreadContext::Required(queue.thread.clone())
    }

    pub fn is_registered(&self, id: &HostThreadId) -> bool {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Runs `work` inline when the caller satisfies `context`, otherwise
    /// enqueues it for the thread that does.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Closed`] after [`shutdown`](Self::shutdown); the
    ///   work is dropped without running.
    /// - [`DispatchError::UnknownThread`] when `context` names a thread that
    ///   was never registered.
    pub fn submit<F>(&self, context: &ThreadContext, work: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }

        match context {
            ThreadContext::Any => {
                run_guarded(context, Box::new(work), self.event_bus.as_ref());
                Ok(())
            }
            ThreadContext::Required(thread) => {
                let queue = self.queue(&thread.id())?;
                if thread.is_current() {
                    run_guarded(context, Box::new(work), self.event_bus.as_ref());
                    return Ok(());
                }
                match queue.push(Box::new(work)) {
                    Ok(()) => {
                        trace!(context = %context, "Work queued");
                        Ok(())
                    }
                    Err(rejected) => {
                        drop(rejected);
                        Err(DispatchError::Closed)
                    }
                }
            }
            ThreadContext::Worker => {
                if WorkerScope::is_active() {
                    run_guarded(context, Box::new(work), self.event_bus.as_ref());
                    return Ok(());
                }
                self.enqueue_worker(Box::new(work))
            }
        }
    }

    fn enqueue_worker(&self, job: Job) -> Result<(), DispatchError> {
        let rejected = {
            let sender = lock(&self.worker_tx);
            match sender.as_ref() {
                Some(tx) => {
                    self.worker_backlog.fetch_add(1, Ordering::AcqRel);
                    match tx.send(job) {
                        Ok(()) => return Ok(()),
                        Err(mpsc::error::SendError(job)) => {
                            self.worker_backlog.fetch_sub(1, Ordering::AcqRel);
                            job
                        }
                    }
                }
                None => job,
            }
        };
        // Dropped outside the sender lock: a job's drop may submit again.
        drop(rejected);
        Err(DispatchError::Closed)
    }

    fn queue(&self, id: &HostThreadId) -> Result<Arc<ContextQueue>, DispatchError> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownThread(id.to_string()))
    }

    /// Runs the work that was queued for `id` when the call started, in
    /// submission order. Work submitted meanwhile waits for the next drain.
    ///
    /// Returns the number of items run.
    ///
    /// # Errors
    ///
    /// [`DispatchError::WrongThread`] unless called from the thread `id`
    /// names; [`DispatchError::UnknownThread`] if it was never registered.
    pub fn drain(&self, id: &HostThreadId) -> Result<usize, DispatchError> {
        let queue = self.queue(id)?;
        if !queue.thread.is_current() {
            return Err(DispatchError::WrongThread {
                expected: id.to_string(),
            });
        }

        let batch = queue.take_all();
        if batch.is_empty() {
            return Ok(0);
        }

        let context = ThreadContext::Required(queue.thread.clone());
        let count = batch.len();
        for job in batch {
            run_guarded(&context, job, self.event_bus.as_ref());
        }
        trace!(thread = %id, count, "Drained queue");
        Ok(count)
    }

    /// Items waiting for `id`; zero for unknown threads.
    pub fn pending(&self, id: &HostThreadId) -> usize {
        self.queue(id).map(|queue| queue.len()).unwrap_or(0)
    }

    /// Worker items submitted but not yet started.
    pub fn worker_backlog(&self) -> usize {
        self.worker_backlog.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes every queue and stops the worker runtime.
    ///
    /// Returns the number of queued items that will never run; later calls
    /// return `0`. Dropped items that carry an outcome hand
    /// `DispatcherClosed` to their handler instead of vanishing.
    ///
    /// Those `DispatcherClosed` handlers run on the thread calling
    /// `shutdown`, not on the thread their context named: once the queues
    /// are closed no thread affinity is honored.
    pub fn shutdown(&self) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let queues: Vec<Arc<ContextQueue>> = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut abandoned: Vec<Job> = Vec::new();
        for queue in queues {
            abandoned.extend(queue.close());
        }

        let sender = lock(&self.worker_tx).take();
        let dropped = abandoned.len() + self.worker_backlog.swap(0, Ordering::AcqRel);
        drop(sender);
        self.runtime.shutdown();

        info!(dropped, "Dispatcher shut down");
        if let Some(bus) = &self.event_bus {
            let _ = bus.emit(RuntimeEvent::Dispatch(DispatchEvent::Closed { dropped }));
        }

        drop(abandoned);
        dropped
    }

    /// The runtime backing [`ThreadContext::Worker`] and suspended
    /// computations.
    pub fn worker_runtime(&self) -> &WorkerRuntime {
        &self.runtime
    }

    pub fn event_bus(&self) -> Option<&EventBus> {
        self.event_bus.as_ref()
    }
}

impl Drop for ThreadAffinityDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ThreadAffinityDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let threads: Vec<String> = self
            .queues
            .read()
            .map(|queues| queues.keys().map(ToString::to_string).collect())
            .unwrap_or_default();
        f.debug_struct("ThreadAffinityDispatcher")
            .field("threads", &threads)
            .field("worker_backlog", &self.worker_backlog())
            .field("closed", &self.is_closed())
            .finish()
    }
}
