//! # Core Cache
//!
//! Single-flight request cache: concurrent requests for one key share one
//! fetch and one result.
//!
//! ## Overview
//!
//! - [`SingleFlightCache`] - key map of shared [`FutureHandle`](core_dispatch::FutureHandle)s
//! - [`CachePolicy`] - TTL for resolved entries and failure eviction
//! - [`CacheStats`] - hit, miss, coalesce and eviction counters
//!
//! Fetchers run through the [`SuspendToFutureBridge`](core_dispatch::SuspendToFutureBridge),
//! never under the cache's lock; each caller's continuations run on the
//! [`ThreadContext`](core_dispatch::ThreadContext) it passed in.

pub mod policy;
pub mod single_flight;
pub mod stats;

pub use policy::CachePolicy;
pub use single_flight::SingleFlightCache;
pub use stats::CacheStats;
