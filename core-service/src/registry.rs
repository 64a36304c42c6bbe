//! # Host Event Registry
//!
//! Explicit mapping from host event types to their listeners, populated at
//! startup. Hosts translate their own event bus into [`EventRegistry::fire`]
//! calls; nothing is discovered by scanning.
//!
//! ## Ordering
//!
//! Listeners fire by [`EventPriority`] (`Lowest` first, `Monitor` last) and
//! then in registration order. A listener registered with
//! [`ListenerOptions::ignore_cancelled`] is skipped once the event reports
//! itself cancelled.
//!
//! ## Completion
//!
//! Every listener returns a [`FutureHandle<()>`] that settles when its work
//! is done. `fire` returns a handle of its own that settles once every
//! listener's handle has settled (or been dropped or cancelled):
//!
//! - [`ExecutionType::Concurrent`] invokes all listeners immediately.
//! - [`ExecutionType::Consecutive`] invokes the next listener only after the
//!   previous one's handle settled, continuing on the event's contract
//!   context. The firing thread never blocks.
//!
//! A panicking listener is logged, reported on the runtime event bus and
//! treated as complete.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use core_dispatch::dispatcher::panic_message;
use core_dispatch::{FetchError, FutureHandle, Outcome, ThreadAffinityDispatcher, ThreadContext};
use core_runtime::events::{DispatchEvent, EventBus, RuntimeEvent};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::contracts::ThreadContracts;

/// An event raised by the host.
///
/// `NAME` keys the event's thread contract in the configuration.
pub trait HostEvent: Send + Sync + 'static {
    const NAME: &'static str;

    /// Whether an earlier listener cancelled the event.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Listener ordering. Lower priorities fire first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
    /// Observe the final state; should not modify the event.
    Monitor,
}

/// How [`EventRegistry::fire`] schedules listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    #[default]
    Concurrent,
    Consecutive,
}

/// Identifies a registered listener for [`EventRegistry::unregister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    pub priority: EventPriority,
    pub ignore_cancelled: bool,
}

impl ListenerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Skip this listener when the event is already cancelled.
    pub fn ignore_cancelled(mut self) -> Self {
        self.ignore_cancelled = true;
        self
    }
}

type ErasedListener = Arc<dyn Fn(&dyn Any) -> Option<FutureHandle<()>> + Send + Sync>;

#[derive(Clone)]
struct Listener {
    id: ListenerId,
    options: ListenerOptions,
    call: ErasedListener,
}

/// Registry of host event listeners for one session.
pub struct EventRegistry {
    dispatcher: Arc<ThreadAffinityDispatcher>,
    contracts: ThreadContracts,
    listeners: RwLock<HashMap<TypeId, Vec<Listener>>>,
    event_bus: Option<EventBus>,
}

impl EventRegistry {
    pub fn new(dispatcher: Arc<ThreadAffinityDispatcher>, contracts: ThreadContracts) -> Self {
        Self {
            dispatcher,
            contracts,
            listeners: RwLock::new(HashMap::new()),
            event_bus: None,
        }
    }

    /// Report listener panics on `event_bus`.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn contracts(&self) -> &ThreadContracts {
        &self.contracts
    }

    /// Registers `listener` for `E` at [`EventPriority::Normal`].
    pub fn register<E, F>(&self, listener: F) -> ListenerId
    where
        E: HostEvent,
        F: Fn(&E) -> FutureHandle<()> + Send + Sync + 'static,
    {
        self.register_with(ListenerOptions::default(), listener)
    }

    pub fn register_with<E, F>(&self, options: ListenerOptions, listener: F) -> ListenerId
    where
        E: HostEvent,
        F: Fn(&E) -> FutureHandle<()> + Send + Sync + 'static,
    {
        let call: ErasedListener =
            Arc::new(move |event: &dyn Any| event.downcast_ref::<E>().map(|event| listener(event)));
        self.insert::<E>(options, call)
    }

    /// Registers a listener whose work is done when it returns.
    pub fn register_fn<E, F>(&self, options: ListenerOptions, listener: F) -> ListenerId
    where
        E: HostEvent,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let call: ErasedListener = Arc::new(move |event: &dyn Any| {
            if let Some(event) = event.downcast_ref::<E>() {
                listener(event);
            }
            None
        });
        self.insert::<E>(options, call)
    }

    fn insert<E: HostEvent>(&self, options: ListenerOptions, call: ErasedListener) -> ListenerId {
        let id = ListenerId::new();
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let slot = listeners.entry(TypeId::of::<E>()).or_default();
        slot.push(Listener { id, options, call });
        // Stable: equal priorities keep registration order.
        slot.sort_by_key(|listener| listener.options.priority);
        debug!(event = E::NAME, listener = %id, priority = ?options.priority, "Listener registered");
        id
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for slot in listeners.values_mut() {
            let before = slot.len();
            slot.retain(|listener| listener.id != id);
            removed |= slot.len() != before;
        }
        removed
    }

    pub fn listener_count<E: HostEvent>(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<E>())
            .map_or(0, Vec::len)
    }

    /// Fires `event` at its listeners.
    ///
    /// The returned handle resumes on the event's contract context and
    /// succeeds once every listener has completed, whatever their outcomes.
    /// It fails with [`FetchError::DispatcherClosed`] if the session closes
    /// mid-chain.
    pub fn fire<E: HostEvent>(&self, event: E, execution: ExecutionType) -> FutureHandle<()> {
        let context = self.contracts.context_for(E::NAME);
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<E>())
            .cloned()
            .unwrap_or_default();
        let done = FutureHandle::new(Arc::clone(&self.dispatcher), context.clone());

        trace!(event = E::NAME, listeners = listeners.len(), ?execution, "Firing event");
        if listeners.is_empty() {
            done.succeed(());
            return done;
        }

        let firing = Arc::new(Firing {
            event,
            listeners,
            context,
            dispatcher: Arc::clone(&self.dispatcher),
            done: done.clone(),
            event_bus: self.event_bus.clone(),
        });
        match execution {
            ExecutionType::Concurrent => firing.run_concurrent(),
            ExecutionType::Consecutive => firing.run_from(0),
        }
        done
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EventRegistry")
            .field("event_types", &listeners.len())
            .field("listeners", &listeners.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

/// One in-progress `fire`.
struct Firing<E> {
    event: E,
    listeners: Vec<Listener>,
    context: ThreadContext,
    dispatcher: Arc<ThreadAffinityDispatcher>,
    done: FutureHandle<()>,
    event_bus: Option<EventBus>,
}

impl<E: HostEvent> Firing<E> {
    /// Invokes one listener. `None` means it has nothing left to wait on.
    fn call(&self, listener: &Listener) -> Option<FutureHandle<()>> {
        if listener.options.ignore_cancelled && self.event.is_cancelled() {
            trace!(event = E::NAME, listener = %listener.id, "Skipping listener for cancelled event");
            return None;
        }

        match panic::catch_unwind(AssertUnwindSafe(|| (listener.call)(&self.event))) {
            Ok(handle) => handle,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(event = E::NAME, listener = %listener.id, %message, "Listener panicked");
                if let Some(bus) = &self.event_bus {
                    let _ = bus.emit(RuntimeEvent::Dispatch(DispatchEvent::HandlerPanicked {
                        context: self.context.to_string(),
                        message,
                    }));
                }
                None
            }
        }
    }

    fn run_concurrent(self: &Arc<Self>) {
        let join = Arc::new(Join {
            remaining: AtomicUsize::new(self.listeners.len()),
            done: self.done.clone(),
        });

        for listener in &self.listeners {
            let completion = Completion(Arc::clone(&join));
            if let Some(handle) = self.call(listener) {
                handle.on_complete_in(ThreadContext::Any, move |outcome| {
                    report::<E>(&outcome);
                    drop(completion);
                });
            }
        }
    }

    /// Invokes listeners from `index` on until one returns a handle to wait
    /// on; the rest of the chain resumes from that handle's continuation.
    fn run_from(self: &Arc<Self>, mut index: usize) {
        while let Some(listener) = self.listeners.get(index) {
            index += 1;
            if let Some(handle) = self.call(listener) {
                let mut next = Next {
                    firing: Arc::clone(self),
                    index,
                    resumed: false,
                };
                handle.on_complete_in(self.context.clone(), move |outcome| {
                    next.resumed = true;
                    if matches!(outcome, Err(FetchError::DispatcherClosed)) {
                        next.firing.done.fail(FetchError::DispatcherClosed);
                        return;
                    }
                    report::<E>(&outcome);
                    next.firing.run_from(next.index);
                });
                return;
            }
        }
        self.done.succeed(());
    }
}

fn report<E: HostEvent>(outcome: &Outcome<()>) {
    if let Err(error) = outcome {
        warn!(event = E::NAME, %error, "Listener completed with an error");
    }
}

struct Join {
    remaining: AtomicUsize,
    done: FutureHandle<()>,
}

/// Counts one listener as complete when dropped, whether its continuation
/// ran or its handle was cancelled.
struct Completion(Arc<Join>);

impl Drop for Completion {
    fn drop(&mut self) {
        if self.0.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.done.succeed(());
        }
    }
}

/// Continuation of a consecutive chain.
///
/// If the handler is dropped without running (the listener's handle was
/// cancelled), the chain resumes through the dispatcher so the next
/// listener still starts on the contract context.
struct Next<E: HostEvent> {
    firing: Arc<Firing<E>>,
    index: usize,
    resumed: bool,
}

impl<E: HostEvent> Drop for Next<E> {
    fn drop(&mut self) {
        if self.resumed {
            return;
        }
        let firing = Arc::clone(&self.firing);
        let index = self.index;
        let context = firing.context.clone();
        let resume = Arc::clone(&firing);
        if firing
            .dispatcher
            .submit(&context, move || resume.run_from(index))
            .is_err()
        {
            firing.done.fail(FetchError::DispatcherClosed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{mpsc, Mutex};
    use std::time::Duration;

    struct Ping;

    impl HostEvent for Ping {
        const NAME: &'static str = "ping";
    }

    struct Chat {
        cancelled: AtomicBool,
    }

    impl HostEvent for Chat {
        const NAME: &'static str = "chat";

        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }
    }

    fn registry() -> EventRegistry {
        let dispatcher = ThreadAffinityDispatcher::builder()
            .worker_threads(2)
            .build()
            .unwrap();
        // Everything on Any so tests need no host loop.
        let contracts = ThreadContracts::new(ThreadContext::Any);
        EventRegistry::new(dispatcher, contracts)
    }

    fn wait(handle: &FutureHandle<()>) -> Outcome<()> {
        let (tx, rx) = mpsc::channel();
        handle.on_complete_in(ThreadContext::Any, move |outcome| tx.send(outcome).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_priority_then_registration_order() {
        let registry = registry();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, priority) in [
            ("monitor", EventPriority::Monitor),
            ("normal-1", EventPriority::Normal),
            ("lowest", EventPriority::Lowest),
            ("normal-2", EventPriority::Normal),
            ("high", EventPriority::High),
        ] {
            let order = Arc::clone(&order);
            registry.register_fn(ListenerOptions::new().priority(priority), move |_: &Ping| {
                order.lock().unwrap().push(label);
            });
        }

        assert!(wait(&registry.fire(Ping, ExecutionType::Concurrent)).is_ok());
        assert_eq!(
            *order.lock().unwrap(),
            vec!["lowest", "normal-1", "normal-2", "high", "monitor"]
        );
    }

    #[test]
    fn test_ignore_cancelled_skips_listener() {
        let registry = registry();
        let seen = Arc::new(Mutex::new(Vec::new()));

        registry.register_fn(ListenerOptions::new().priority(EventPriority::Low), |chat: &Chat| {
            chat.cancelled.store(true, Ordering::SeqCst);
        });
        let skipped = Arc::clone(&seen);
        registry.register_fn(ListenerOptions::new().ignore_cancelled(), move |_: &Chat| {
            skipped.lock().unwrap().push("ignoring");
        });
        let monitor = Arc::clone(&seen);
        registry.register_fn(
            ListenerOptions::new().priority(EventPriority::Monitor),
            move |chat: &Chat| {
                assert!(chat.is_cancelled());
                monitor.lock().unwrap().push("monitor");
            },
        );

        let chat = Chat {
            cancelled: AtomicBool::new(false),
        };
        assert!(wait(&registry.fire(chat, ExecutionType::Concurrent)).is_ok());
        assert_eq!(*seen.lock().unwrap(), vec!["monitor"]);
    }

    #[test]
    fn test_no_listeners_completes_immediately() {
        let registry = registry();
        let handle = registry.fire(Ping, ExecutionType::Consecutive);
        assert!(matches!(handle.peek(), Some(Ok(()))));
    }

    #[test]
    fn test_concurrent_waits_for_every_listener() {
        let registry = registry();
        let gates: Vec<FutureHandle<()>> = (0..3)
            .map(|_| FutureHandle::new(Arc::clone(&registry.dispatcher), ThreadContext::Any))
            .collect();

        for gate in &gates {
            let gate = gate.clone();
            registry.register(move |_: &Ping| gate.clone());
        }

        let done = registry.fire(Ping, ExecutionType::Concurrent);
        gates[0].succeed(());
        gates[2].fail(FetchError::Cancelled);
        std::thread::sleep(Duration::from_millis(20));
        assert!(done.is_pending());

        gates[1].succeed(());
        assert!(wait(&done).is_ok());
    }

    #[test]
    fn test_consecutive_starts_next_after_previous_settles() {
        let registry = registry();
        let first_gate = FutureHandle::new(Arc::clone(&registry.dispatcher), ThreadContext::Any);
        let second_started = Arc::new(AtomicBool::new(false));

        let gate = first_gate.clone();
        registry.register(move |_: &Ping| gate.clone());
        let started = Arc::clone(&second_started);
        registry.register_fn(ListenerOptions::new(), move |_: &Ping| {
            started.store(true, Ordering::SeqCst);
        });

        let done = registry.fire(Ping, ExecutionType::Consecutive);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!second_started.load(Ordering::SeqCst));
        assert!(done.is_pending());

        first_gate.succeed(());
        assert!(wait(&done).is_ok());
        assert!(second_started.load(Ordering::SeqCst));
    }

    #[test]
    fn test_consecutive_continues_past_cancelled_listener() {
        let registry = registry();
        let gate = FutureHandle::new(Arc::clone(&registry.dispatcher), ThreadContext::Any);
        let ran = Arc::new(AtomicBool::new(false));

        let listener_gate = gate.clone();
        registry.register(move |_: &Ping| listener_gate.clone());
        let flag = Arc::clone(&ran);
        registry.register_fn(ListenerOptions::new(), move |_: &Ping| {
            flag.store(true, Ordering::SeqCst);
        });

        let done = registry.fire(Ping, ExecutionType::Consecutive);
        assert!(gate.cancel());
        assert!(wait(&done).is_ok());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_listener_is_contained_and_reported() {
        let bus = EventBus::new(8);
        let mut events = bus.subscribe();
        let registry = registry().with_event_bus(bus);
        let after = Arc::new(AtomicBool::new(false));

        registry.register_fn(ListenerOptions::new(), |_: &Ping| panic!("listener exploded"));
        let flag = Arc::clone(&after);
        registry.register_fn(ListenerOptions::new(), move |_: &Ping| {
            flag.store(true, Ordering::SeqCst);
        });

        assert!(wait(&registry.fire(Ping, ExecutionType::Consecutive)).is_ok());
        assert!(after.load(Ordering::SeqCst));
        match events.try_recv().unwrap() {
            RuntimeEvent::Dispatch(DispatchEvent::HandlerPanicked { context, message }) => {
                assert_eq!(context, "any");
                assert_eq!(message, "listener exploded");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_unregister() {
        let registry = registry();
        let id = registry.register_fn(ListenerOptions::new(), |_: &Ping| {});
        registry.register_fn(ListenerOptions::new(), |_: &Ping| {});
        assert_eq!(registry.listener_count::<Ping>(), 2);

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert_eq!(registry.listener_count::<Ping>(), 1);
        assert_eq!(registry.listener_count::<Chat>(), 0);
    }
}
