//! # Single-Flight Cache
//!
//! Coalesces concurrent requests for the same key into one fetch.
//!
//! The key map sits behind one `Mutex` that is only held for check-and-insert
//! and bookkeeping; fetchers are started after it is released. Each entry
//! owns a root [`FutureHandle`] resolving on [`ThreadContext::Any`]; every
//! caller gets its own derived handle resuming on the context it asked for,
//! so one caller cancelling never affects another.
//!
//! Entries carry a generation number. A fetch that settles after its entry
//! was invalidated or replaced leaves the newer entry alone.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bridge_traits::time::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use core_dispatch::dispatcher::panic_message;
use core_dispatch::{FetchError, FutureHandle, Outcome, SuspendToFutureBridge, ThreadContext};
use core_runtime::events::{CacheEvent, EventBus, EvictionReason, RuntimeEvent};
use tracing::{debug, instrument, trace, warn};

use crate::policy::CachePolicy;
use crate::stats::{CacheCounters, CacheStats};

type EntryMap<K, V> = Mutex<HashMap<K, Entry<V>>>;

struct Entry<V> {
    generation: u64,
    handle: FutureHandle<V>,
    resolved_at: Option<DateTime<Utc>>,
}

enum Claim<V> {
    /// A live entry already exists.
    Joined(FutureHandle<V>),
    /// A new entry was inserted; the caller must start the fetch.
    Started(FutureHandle<V>),
}

fn lock<K, V>(entries: &EntryMap<K, V>) -> MutexGuard<'_, HashMap<K, Entry<V>>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publishes cache notifications; shared by the cache and its settle hooks.
#[derive(Clone)]
struct Reporter {
    counters: Arc<CacheCounters>,
    event_bus: Option<EventBus>,
}

impl Reporter {
    fn evicted<K: fmt::Debug>(&self, key: &K, reason: EvictionReason) {
        self.counters.evict(1);
        trace!(key = ?key, ?reason, "Entry evicted");
        self.emit(CacheEvent::Evicted {
            key: format!("{key:?}"),
            reason,
        });
    }

    fn fetch_failed<K: fmt::Debug>(&self, key: &K, error: &FetchError) {
        warn!(key = ?key, %error, "Fetch failed");
        self.emit(CacheEvent::FetchFailed {
            key: format!("{key:?}"),
            message: error.to_string(),
        });
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(bus) = &self.event_bus {
            let _ = bus.emit(RuntimeEvent::Cache(event));
        }
    }
}

/// Records the outcome of one generation's fetch in its entry.
struct SettleHook<K, V> {
    entries: Weak<EntryMap<K, V>>,
    key: K,
    generation: u64,
    policy: CachePolicy,
    clock: Arc<dyn Clock>,
    reporter: Reporter,
}

impl<K, V> SettleHook<K, V>
where
    K: Eq + Hash + fmt::Debug,
{
    fn settled(self, outcome: &Outcome<V>) {
        let Some(entries) = self.entries.upgrade() else {
            return;
        };
        let failed = outcome.is_err();
        let resolved_at = self.clock.now();

        let evicted = {
            let mut map = lock(&entries);
            let current = map
                .get(&self.key)
                .is_some_and(|entry| entry.generation == self.generation);

            if !current {
                trace!(key = ?self.key, generation = self.generation, "Settled generation no longer cached");
                None
            } else if failed && self.policy.evict_failures {
                map.remove(&self.key)
            } else {
                if let Some(entry) = map.get_mut(&self.key) {
                    entry.resolved_at = Some(resolved_at);
                }
                None
            }
        };

        if let Err(error) = outcome {
            self.reporter.fetch_failed(&self.key, error);
        }
        if let Some(entry) = evicted {
            self.reporter.evicted(&self.key, EvictionReason::Failed);
            drop(entry);
        }
    }
}

/// Request cache that runs at most one fetch per key at a time.
///
/// # Example
///
/// ```rust
/// use core_cache::SingleFlightCache;
/// use core_dispatch::{SuspendToFutureBridge, ThreadAffinityDispatcher, ThreadContext};
/// use std::sync::mpsc;
///
/// let dispatcher = ThreadAffinityDispatcher::builder().worker_threads(1).build().unwrap();
/// let cache = SingleFlightCache::new(SuspendToFutureBridge::new(dispatcher));
///
/// let handle = cache.get_or_fetch("player-42".to_string(), ThreadContext::Any, |id| {
///     let id = id.clone();
///     async move { Ok(format!("profile of {id}")) }
/// });
///
/// let (tx, rx) = mpsc::channel();
/// handle.on_success(move |profile| tx.send(profile).unwrap());
/// assert_eq!(rx.recv().unwrap(), "profile of player-42");
/// ```
pub struct SingleFlightCache<K, V> {
    entries: Arc<EntryMap<K, V>>,
    bridge: SuspendToFutureBridge,
    policy: CachePolicy,
    clock: Arc<dyn Clock>,
    next_generation: AtomicU64,
    reporter: Reporter,
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(bridge: SuspendToFutureBridge) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            bridge,
            policy: CachePolicy::default(),
            clock: Arc::new(SystemClock),
            next_generation: AtomicU64::new(0),
            reporter: Reporter {
                counters: Arc::new(CacheCounters::default()),
                event_bus: None,
            },
        }
    }

    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Time source for `resolved_at` stamps and TTL checks.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Publish failures and evictions on `event_bus`.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.reporter.event_bus = Some(event_bus);
        self
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn bridge(&self) -> &SuspendToFutureBridge {
        &self.bridge
    }

    /// Returns a handle for `key`, resuming on `context`.
    ///
    /// Joins a pending or live resolved entry when one exists; otherwise
    /// inserts a new entry and then, outside the map lock, calls `fetcher`
    /// exactly once.
    #[instrument(skip_all, fields(key = ?key))]
    pub fn get_or_fetch<F, Fut>(&self, key: K, context: ThreadContext, fetcher: F) -> FutureHandle<V>
    where
        F: FnOnce(&K) -> Fut,
        Fut: Future<Output = Outcome<V>> + Send + 'static,
    {
        match self.claim(&key) {
            Claim::Joined(root) => root.subscribe(context),
            Claim::Started(root) => {
                let derived = root.subscribe(context);
                match panic::catch_unwind(AssertUnwindSafe(|| fetcher(&key))) {
                    Ok(fetch) => self.bridge.invoke_into(&root, fetch),
                    Err(payload) => {
                        root.resolve(Err(FetchError::Panicked(panic_message(payload.as_ref()))));
                    }
                }
                derived
            }
        }
    }

    /// Like [`get_or_fetch`](Self::get_or_fetch) for a synchronous fetcher,
    /// which runs on the dispatcher's worker context.
    #[instrument(skip_all, fields(key = ?key))]
    pub fn get_or_fetch_blocking<F>(&self, key: K, context: ThreadContext, fetcher: F) -> FutureHandle<V>
    where
        F: FnOnce(&K) -> Outcome<V> + Send + 'static,
    {
        match self.claim(&key) {
            Claim::Joined(root) => root.subscribe(context),
            Claim::Started(root) => {
                let derived = root.subscribe(context);
                self.bridge.invoke_blocking_into(&root, move || fetcher(&key));
                derived
            }
        }
    }

    fn claim(&self, key: &K) -> Claim<V> {
        let now = self.clock.now();

        let (claim, expired) = {
            let mut entries = lock(&self.entries);
            let existing = entries
                .get(key)
                .map(|entry| (entry.resolved_at, entry.handle.clone()));

            let mut expired = None;
            match existing {
                Some((None, handle)) => {
                    self.reporter.counters.coalesce();
                    trace!("Joined fetch in flight");
                    return Claim::Joined(handle);
                }
                Some((Some(resolved_at), handle)) => {
                    if !self.policy.is_expired(resolved_at, now) {
                        self.reporter.counters.hit();
                        trace!("Served resolved entry");
                        return Claim::Joined(handle);
                    }
                    expired = entries.remove(key);
                }
                None => {}
            }

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let root = self.bridge.handle(ThreadContext::Any);
            let hook = SettleHook {
                entries: Arc::downgrade(&self.entries),
                key: key.clone(),
                generation,
                policy: self.policy,
                clock: Arc::clone(&self.clock),
                reporter: self.reporter.clone(),
            };
            root.on_complete_in(ThreadContext::Any, move |outcome| hook.settled(&outcome));

            entries.insert(
                key.clone(),
                Entry {
                    generation,
                    handle: root.clone(),
                    resolved_at: None,
                },
            );
            self.reporter.counters.miss();
            debug!(generation, "Starting fetch");
            (Claim::Started(root), expired)
        };

        if let Some(entry) = expired {
            self.reporter.evicted(key, EvictionReason::Expired);
            drop(entry);
        }
        claim
    }

    /// Removes `key` so the next request fetches again. Handles already
    /// returned are unaffected.
    pub fn invalidate(&self, key: &K) -> bool {
        let removed = lock(&self.entries).remove(key);
        match removed {
            Some(entry) => {
                self.reporter.evicted(key, EvictionReason::Invalidated);
                drop(entry);
                true
            }
            None => false,
        }
    }

    /// Removes every entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let removed: Vec<(K, Entry<V>)> = lock(&self.entries).drain().collect();
        for (key, _) in &removed {
            self.reporter.evicted(key, EvictionReason::Invalidated);
        }
        removed.len()
    }

    /// Eagerly removes resolved entries older than the TTL.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let removed: Vec<(K, Entry<V>)> = {
            let mut entries = lock(&self.entries);
            let stale: Vec<K> = entries
                .iter()
                .filter(|(_, entry)| {
                    entry
                        .resolved_at
                        .is_some_and(|resolved_at| self.policy.is_expired(resolved_at, now))
                })
                .map(|(key, _)| key.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|key| entries.remove_entry(&key))
                .collect()
        };
        for (key, _) in &removed {
            self.reporter.evicted(key, EvictionReason::Expired);
        }
        removed.len()
    }

    /// The resolved outcome for `key`, if a live entry has one.
    pub fn peek(&self, key: &K) -> Option<Outcome<V>> {
        let now = self.clock.now();
        let handle = {
            let entries = lock(&self.entries);
            let entry = entries.get(key)?;
            if let Some(resolved_at) = entry.resolved_at {
                if self.policy.is_expired(resolved_at, now) {
                    return None;
                }
            }
            entry.handle.clone()
        };
        handle.peek()
    }

    /// Whether a request for `key` would be served without a new fetch.
    pub fn contains(&self, key: &K) -> bool {
        let now = self.clock.now();
        lock(&self.entries).get(key).is_some_and(|entry| {
            entry
                .resolved_at
                .map_or(true, |resolved_at| !self.policy.is_expired(resolved_at, now))
        })
    }

    /// Number of entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.reporter.counters.snapshot()
    }
}

impl<K, V> fmt::Debug for SingleFlightCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .entries
            .lock()
            .map(|entries| entries.len())
            .unwrap_or_default();
        f.debug_struct("SingleFlightCache")
            .field("entries", &entries)
            .field("policy", &self.policy)
            .field("stats", &self.reporter.counters.snapshot())
            .finish()
    }
}
