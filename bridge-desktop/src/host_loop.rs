//! Primary-thread tick loop for desktop hosts.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bridge_traits::error::{BridgeError, Result};
use bridge_traits::host::{BoundThread, HostThread, HostThreadId};
use core_async::sync::CancellationToken;
use core_dispatch::dispatcher::panic_message;
use core_dispatch::{ThreadAffinityDispatcher, ThreadContext};
use core_runtime::config::CoreConfig;
use core_runtime::events::{DispatchEvent, RuntimeEvent};
use tracing::{debug, error, info, trace, warn};

type TickHook = Box<dyn FnMut(u64) + Send + 'static>;

/// Builder for [`DesktopHostLoop`].
pub struct HostLoopBuilder {
    dispatcher: Arc<ThreadAffinityDispatcher>,
    thread_name: String,
    thread: Option<Arc<BoundThread>>,
    tick_interval: Duration,
    on_tick: Option<TickHook>,
}

impl HostLoopBuilder {
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Binds an existing identity instead of creating one. Use this when the
    /// thread was registered with the dispatcher before the loop starts.
    pub fn bound_thread(mut self, thread: Arc<BoundThread>) -> Self {
        self.thread_name = thread.id().to_string();
        self.thread = Some(thread);
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Host logic run on the primary thread once per tick, after the queue
    /// has been drained. Receives the tick number.
    pub fn on_tick<F>(mut self, hook: F) -> Self
    where
        F: FnMut(u64) + Send + 'static,
    {
        self.on_tick = Some(Box::new(hook));
        self
    }

    /// Spawns the primary thread, binds it and registers it with the
    /// dispatcher. Returns once the thread is bound.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Io`] if the thread cannot be spawned,
    /// [`BridgeError::OperationFailed`] if the tick interval is zero or the
    /// thread exits before binding.
    pub fn start(self) -> Result<DesktopHostLoop> {
        if self.tick_interval.is_zero() {
            return Err(BridgeError::OperationFailed(
                "tick interval must be greater than zero".to_string(),
            ));
        }

        let main = self
            .thread
            .unwrap_or_else(|| Arc::new(BoundThread::new(self.thread_name.clone())));
        let context = self.dispatcher.register_thread(Arc::clone(&main));
        let shutdown = CancellationToken::new();
        let ticks = Arc::new(AtomicU64::new(0));
        let (ready_tx, ready_rx) = mpsc::channel();

        let join = {
            let main = Arc::clone(&main);
            let dispatcher = Arc::clone(&self.dispatcher);
            let shutdown = shutdown.clone();
            let ticks = Arc::clone(&ticks);
            let tick_interval = self.tick_interval;
            let mut on_tick = self.on_tick;

            thread::Builder::new()
                .name(self.thread_name.clone())
                .spawn(move || {
                    let bound = main.bind_current();
                    let failed = bound.is_err();
                    let _ = ready_tx.send(bound);
                    if failed {
                        return;
                    }
                    run(&dispatcher, &main.id(), tick_interval, &shutdown, &ticks, &mut on_tick);
                })?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(error)) => return Err(error),
            Err(_) => {
                return Err(BridgeError::OperationFailed(
                    "primary thread exited before binding".to_string(),
                ))
            }
        }

        info!(
            thread = %self.thread_name,
            tick_ms = self.tick_interval.as_millis() as u64,
            "Desktop host loop started"
        );

        Ok(DesktopHostLoop {
            main,
            context,
            shutdown,
            ticks,
            join: Some(join),
        })
    }
}

/// Closes the dispatcher once the primary thread stops draining, so work
/// routed to it fails with `DispatcherClosed` instead of waiting forever.
struct CloseOnExit<'a>(&'a ThreadAffinityDispatcher);

impl Drop for CloseOnExit<'_> {
    fn drop(&mut self) {
        let dropped = self.0.shutdown();
        if dropped > 0 {
            warn!(dropped, "Primary thread exited with work still queued");
        }
    }
}

fn run(
    dispatcher: &ThreadAffinityDispatcher,
    id: &HostThreadId,
    tick_interval: Duration,
    shutdown: &CancellationToken,
    ticks: &AtomicU64,
    on_tick: &mut Option<TickHook>,
) {
    let _close = CloseOnExit(dispatcher);
    let mut next_tick = Instant::now();
    while !shutdown.is_cancelled() {
        let tick = ticks.fetch_add(1, Ordering::AcqRel) + 1;
        match dispatcher.drain(id) {
            Ok(0) => {}
            Ok(count) => trace!(tick, count, "Ran queued work"),
            Err(error) => warn!(%error, "Drain failed"),
        }
        if let Some(hook) = on_tick.as_mut() {
            run_hook(dispatcher, id, hook, tick);
        }

        next_tick += tick_interval;
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        } else {
            // Overran; don't try to catch up on missed ticks.
            next_tick = now;
        }
    }

    // Work queued before the stop request still gets its tick.
    let _ = dispatcher.drain(id);
    debug!(thread = %id, "Desktop host loop exited");
}

fn run_hook(dispatcher: &ThreadAffinityDispatcher, id: &HostThreadId, hook: &mut TickHook, tick: u64) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook(tick))) {
        let message = panic_message(payload.as_ref());
        error!(thread = %id, tick, panic = %message, "Tick hook panicked; continuing");
        if let Some(bus) = dispatcher.event_bus() {
            let _ = bus.emit(RuntimeEvent::Dispatch(DispatchEvent::HandlerPanicked {
                context: format!("required({id})"),
                message,
            }));
        }
    }
}

/// A dedicated OS thread acting as the host's primary thread.
///
/// Each tick it runs whatever the dispatcher queued for it, then the
/// optional tick hook. Stopped on [`stop`](Self::stop) or drop. The loop
/// is the only drainer of its queue, so the dispatcher is shut down when
/// the loop exits.
///
/// # Example
///
/// ```rust
/// use bridge_desktop::DesktopHostLoop;
/// use core_dispatch::ThreadAffinityDispatcher;
/// use std::sync::mpsc;
///
/// let dispatcher = ThreadAffinityDispatcher::builder().worker_threads(1).build().unwrap();
/// let host = DesktopHostLoop::builder(dispatcher.clone()).start().unwrap();
///
/// let (tx, rx) = mpsc::channel();
/// dispatcher
///     .submit(&host.context(), move || {
///         tx.send(std::thread::current().name().map(str::to_string)).unwrap();
///     })
///     .unwrap();
///
/// assert_eq!(rx.recv().unwrap().as_deref(), Some("server-main"));
/// host.stop();
/// ```
pub struct DesktopHostLoop {
    main: Arc<BoundThread>,
    context: ThreadContext,
    shutdown: CancellationToken,
    ticks: Arc<AtomicU64>,
    join: Option<JoinHandle<()>>,
}

impl DesktopHostLoop {
    /// Defaults: thread `server-main`, 16 ms ticks.
    pub fn builder(dispatcher: Arc<ThreadAffinityDispatcher>) -> HostLoopBuilder {
        HostLoopBuilder {
            dispatcher,
            thread_name: "server-main".to_string(),
            thread: None,
            tick_interval: Duration::from_millis(16),
            on_tick: None,
        }
    }

    /// Builder seeded with the thread name and tick interval of `config`.
    pub fn from_config(dispatcher: Arc<ThreadAffinityDispatcher>, config: &CoreConfig) -> HostLoopBuilder {
        Self::builder(dispatcher)
            .thread_name(config.main_thread_name.clone())
            .tick_interval(config.tick_interval())
    }

    /// Context that targets the primary thread.
    pub fn context(&self) -> ThreadContext {
        self.context.clone()
    }

    pub fn thread(&self) -> Arc<BoundThread> {
        Arc::clone(&self.main)
    }

    pub fn id(&self) -> HostThreadId {
        self.main.id()
    }

    /// Ticks started so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    /// Token that stops the loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops the loop and waits for the primary thread to exit.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.shutdown.cancel();
        if let Some(join) = self.join.take() {
            if join.thread().id() == thread::current().id() {
                // Stopped from inside a tick; the loop exits on its own.
                return;
            }
            if join.join().is_err() {
                warn!(thread = %self.main.id(), "Primary thread panicked");
            }
        }
    }
}

impl Drop for DesktopHostLoop {
    fn drop(&mut self) {
        self.halt();
    }
}

impl fmt::Debug for DesktopHostLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DesktopHostLoop")
            .field("thread", &self.main.id().as_str())
            .field("ticks", &self.ticks())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_runtime::events::EventBus;
    use std::sync::atomic::AtomicBool;

    fn dispatcher() -> Arc<ThreadAffinityDispatcher> {
        ThreadAffinityDispatcher::builder()
            .worker_threads(1)
            .build()
            .unwrap()
    }

    #[test]
    fn test_work_runs_on_named_primary_thread() {
        let dispatcher = dispatcher();
        let host = DesktopHostLoop::builder(Arc::clone(&dispatcher))
            .thread_name("test-main")
            .tick_interval(Duration::from_millis(2))
            .start()
            .unwrap();
        let (tx, rx) = mpsc::channel();

        let context = host.context();
        let inside = context.clone();
        dispatcher
            .submit(&context, move || {
                let name = thread::current().name().map(str::to_string);
                tx.send((name, inside.is_satisfied())).unwrap();
            })
            .unwrap();

        let (name, satisfied) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("test-main"));
        assert!(satisfied);
        assert!(!host.context().is_satisfied());
        assert!(host.thread().is_bound());
    }

    #[test]
    fn test_panicking_tick_hook_keeps_loop_alive() {
        let bus = EventBus::new(8);
        let mut events = bus.subscribe();
        let dispatcher = ThreadAffinityDispatcher::builder()
            .worker_threads(1)
            .event_bus(bus)
            .build()
            .unwrap();
        let (ticks_tx, ticks_rx) = mpsc::channel();
        let host = DesktopHostLoop::builder(Arc::clone(&dispatcher))
            .thread_name("test-main")
            .tick_interval(Duration::from_millis(1))
            .on_tick(move |tick| {
                let _ = ticks_tx.send(tick);
                if tick == 3 {
                    panic!("tick hook exploded");
                }
            })
            .start()
            .unwrap();

        let seen: Vec<u64> = ticks_rx.iter().take(5).collect();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert!(host.is_running());

        let (tx, rx) = mpsc::channel();
        dispatcher
            .submit(&host.context(), move || tx.send("ran").unwrap())
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "ran");

        match events.try_recv().unwrap() {
            RuntimeEvent::Dispatch(DispatchEvent::HandlerPanicked { context, message }) => {
                assert_eq!(context, "required(test-main)");
                assert_eq!(message, "tick hook exploded");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        host.stop();
    }

    #[test]
    fn test_stopping_the_loop_closes_the_dispatcher() {
        let dispatcher = dispatcher();
        let host = DesktopHostLoop::builder(Arc::clone(&dispatcher))
            .tick_interval(Duration::from_millis(1))
            .start()
            .unwrap();
        let context = host.context();
        host.stop();

        assert!(dispatcher.is_closed());
        let result = dispatcher.submit(&context, || {});
        assert!(matches!(result, Err(core_dispatch::DispatchError::Closed)));
    }

    #[test]
    fn test_tick_hook_runs_every_tick() {
        let dispatcher = dispatcher();
        let (tx, rx) = mpsc::channel();
        let host = DesktopHostLoop::builder(dispatcher)
            .tick_interval(Duration::from_millis(1))
            .on_tick(move |tick| {
                let _ = tx.send(tick);
            })
            .start()
            .unwrap();

        let first: Vec<u64> = rx.iter().take(3).collect();
        assert_eq!(first, vec![1, 2, 3]);
        assert!(host.ticks() >= 3);
    }

    #[test]
    fn test_stop_joins_thread() {
        let dispatcher = dispatcher();
        let host = DesktopHostLoop::builder(dispatcher)
            .tick_interval(Duration::from_millis(1))
            .start()
            .unwrap();
        assert!(host.is_running());

        let token = host.shutdown_token();
        host.stop();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_work_queued_before_stop_still_runs() {
        let dispatcher = dispatcher();
        let host = DesktopHostLoop::builder(Arc::clone(&dispatcher))
            .tick_interval(Duration::from_millis(50))
            .start()
            .unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        dispatcher
            .submit(&host.context(), move || flag.store(true, Ordering::SeqCst))
            .unwrap();
        host.stop();

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_zero_tick_interval_is_rejected() {
        let result = DesktopHostLoop::builder(dispatcher())
            .tick_interval(Duration::ZERO)
            .start();
        assert!(matches!(result, Err(BridgeError::OperationFailed(_))));
    }

    #[test]
    fn test_prebound_identity_keeps_registration() {
        let dispatcher = dispatcher();
        let main = Arc::new(BoundThread::new("shared-main"));
        let registered = dispatcher.register_thread(Arc::clone(&main));

        let host = DesktopHostLoop::builder(Arc::clone(&dispatcher))
            .bound_thread(Arc::clone(&main))
            .tick_interval(Duration::from_millis(2))
            .start()
            .unwrap();
        assert!(main.is_bound());

        let (tx, rx) = mpsc::channel();
        dispatcher
            .submit(&registered, move || {
                tx.send(thread::current().name().map(str::to_string)).unwrap();
            })
            .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap().as_deref(),
            Some("shared-main")
        );
        host.stop();
    }

    #[test]
    fn test_from_config() {
        let config = CoreConfig::builder()
            .main_thread_name("region-main")
            .tick_interval(Duration::from_millis(5))
            .build()
            .unwrap();
        let host = DesktopHostLoop::from_config(dispatcher(), &config)
            .start()
            .unwrap();
        assert_eq!(host.id().as_str(), "region-main");
    }
}
