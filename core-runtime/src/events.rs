//! # Runtime Notification Bus
//!
//! Broadcast channel through which the dispatcher, the cache and the session
//! report things the host may want to observe but that must never interrupt
//! the thread that caused them: a handler that panicked, a dispatcher that
//! closed with work still queued, a fetch that failed, an entry that was
//! evicted.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   emit    ┌───────────┐  subscribe  ┌──────────────┐
//! │ Dispatcher ├──────────>│           ├────────────>│ host logger  │
//! └────────────┘           │ EventBus  │             └──────────────┘
//! ┌────────────┐   emit    │ (broadcast│  subscribe  ┌──────────────┐
//! │   Cache    ├──────────>│  channel) ├────────────>│ metrics/test │
//! └────────────┘           └───────────┘             └──────────────┘
//! ```
//!
//! Emitting never blocks and never fails the emitter: with no subscribers
//! the event is simply dropped.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{DispatchEvent, EventBus, RuntimeEvent};
//!
//! let bus = EventBus::new(16);
//! let mut stream = bus.subscribe();
//!
//! bus.emit(RuntimeEvent::Dispatch(DispatchEvent::HandlerPanicked {
//!     context: "server-main".to_string(),
//!     message: "boom".to_string(),
//! }))
//! .unwrap();
//!
//! let event = stream.try_recv().unwrap();
//! assert_eq!(event.description(), "Handler panicked");
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber missed `n` events; it may
//!   keep receiving.
//! - **`RecvError::Closed`**: every sender is gone; treat as shutdown.

use core_async::sync::broadcast;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use core_async::sync::broadcast::error::{RecvError, SendError};
pub use core_async::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Runtime Event Types
// ============================================================================

/// Top-level event enum published through the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum RuntimeEvent {
    /// Dispatcher lifecycle and dispatch-boundary failures
    Dispatch(DispatchEvent),
    /// Single-flight cache activity
    Cache(CacheEvent),
}

impl RuntimeEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            RuntimeEvent::Dispatch(e) => e.description(),
            RuntimeEvent::Cache(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            RuntimeEvent::Dispatch(DispatchEvent::HandlerPanicked { .. }) => EventSeverity::Error,
            RuntimeEvent::Dispatch(DispatchEvent::Closed { dropped }) if *dropped > 0 => {
                EventSeverity::Warning
            }
            RuntimeEvent::Cache(CacheEvent::FetchFailed { .. }) => EventSeverity::Warning,
            RuntimeEvent::Dispatch(DispatchEvent::Closed { .. }) => EventSeverity::Info,
            RuntimeEvent::Cache(CacheEvent::Evicted { .. }) => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Events raised at the dispatch boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum DispatchEvent {
    /// A handler panicked; the panic was caught and the queue kept draining.
    HandlerPanicked {
        /// The thread context the handler ran in.
        context: String,
        /// Panic payload rendered as text.
        message: String,
    },
    /// The dispatcher was shut down.
    Closed {
        /// Queued work items that were never run.
        dropped: usize,
    },
}

impl DispatchEvent {
    fn description(&self) -> &str {
        match self {
            DispatchEvent::HandlerPanicked { .. } => "Handler panicked",
            DispatchEvent::Closed { .. } => "Dispatcher closed",
        }
    }
}

/// Why a cache entry left the cache.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EvictionReason {
    /// Resolved longer ago than the configured TTL.
    Expired,
    /// Removed by `invalidate` or `clear`.
    Invalidated,
    /// The fetch failed and failures are not cached.
    Failed,
}

/// Events raised by the single-flight cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum CacheEvent {
    /// A fetch settled with an error.
    FetchFailed {
        /// Debug rendering of the key.
        key: String,
        /// Error message.
        message: String,
    },
    /// An entry was removed.
    Evicted {
        /// Debug rendering of the key.
        key: String,
        reason: EvictionReason,
    },
}

impl CacheEvent {
    fn description(&self) -> &str {
        match self {
            CacheEvent::FetchFailed { .. } => "Fetch failed",
            CacheEvent::Evicted { .. } => "Cache entry evicted",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for runtime notifications.
///
/// Cloning is cheap; all clones share the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error if there are none.
    pub fn emit(&self, event: RuntimeEvent) -> Result<usize, SendError<RuntimeEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&RuntimeEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{EventBus, EventSeverity, EventStream};
///
/// let bus = EventBus::default();
/// let errors = EventStream::new(bus.subscribe())
///     .filter(|event| event.severity() >= EventSeverity::Error);
/// ```
pub struct EventStream {
    receiver: Receiver<RuntimeEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<RuntimeEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` are returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RuntimeEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &RuntimeEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter.
    pub async fn recv(&mut self) -> Result<RuntimeEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without waiting.
    ///
    /// Returns `None` if no matching event is currently available.
    pub fn try_recv(&mut self) -> Option<Result<RuntimeEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn panicked(context: &str) -> RuntimeEvent {
        RuntimeEvent::Dispatch(DispatchEvent::HandlerPanicked {
            context: context.to_string(),
            message: "boom".to_string(),
        })
    }

    fn evicted(key: &str) -> RuntimeEvent {
        RuntimeEvent::Cache(CacheEvent::Evicted {
            key: key.to_string(),
            reason: EvictionReason::Invalidated,
        })
    }

    #[test]
    fn test_emission_without_subscribers_is_an_error_not_a_panic() {
        let bus = EventBus::new(10);
        assert!(bus.emit(panicked("main")).is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        assert_eq!(bus.emit(panicked("main")).unwrap(), 2);

        assert_eq!(first.recv().await.unwrap(), panicked("main"));
        assert_eq!(second.recv().await.unwrap(), panicked("main"));
    }

    #[tokio::test]
    async fn test_event_stream_with_filter() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe())
            .filter(|event| matches!(event, RuntimeEvent::Cache(_)));

        bus.emit(panicked("main")).unwrap();
        bus.emit(evicted("player-42")).unwrap();

        assert_eq!(stream.recv().await.unwrap(), evicted("player-42"));
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.emit(evicted(&format!("k{i}"))).unwrap();
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn test_event_severity() {
        assert_eq!(panicked("main").severity(), EventSeverity::Error);
        assert_eq!(
            RuntimeEvent::Dispatch(DispatchEvent::Closed { dropped: 3 }).severity(),
            EventSeverity::Warning
        );
        assert_eq!(
            RuntimeEvent::Dispatch(DispatchEvent::Closed { dropped: 0 }).severity(),
            EventSeverity::Info
        );
        assert_eq!(evicted("k").severity(), EventSeverity::Debug);
    }

    #[test]
    fn test_event_serialization_shape() {
        let json = serde_json::to_value(panicked("server-main")).unwrap();
        assert_eq!(json["type"], "Dispatch");
        assert_eq!(json["payload"]["event"], "HandlerPanicked");
        assert_eq!(json["payload"]["context"], "server-main");
    }

    #[test]
    fn test_try_recv_empty_and_filtered() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe())
            .filter(|event| event.severity() >= EventSeverity::Error);

        assert!(stream.try_recv().is_none());

        bus.emit(evicted("k")).unwrap();
        assert!(stream.try_recv().is_none());

        bus.emit(panicked("main")).unwrap();
        assert_eq!(stream.try_recv().unwrap().unwrap(), panicked("main"));
    }
}
