//! # Core Configuration Module
//!
//! Configuration for the dispatcher, the single-flight cache and the
//! session façade.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a
//! `CoreConfig`. Hosts that keep their settings in a file can instead load a
//! JSON document with [`CoreConfig::from_json`]; missing fields fall back to
//! the defaults below. Both paths run the same fail-fast validation.
//!
//! | Field | Default |
//! |-------|---------|
//! | `tick_interval_ms` | 16 (~60 ticks per second) |
//! | `worker_threads` | 4 |
//! | `thread_name_prefix` | `affinity-worker` |
//! | `main_thread_name` | `server-main` |
//! | `cache_ttl_ms` | none (entries live until invalidated) |
//! | `evict_failures` | true |
//! | `fetch_timeout_ms` | none |
//! | `shutdown_strategy` | `scheduler` |
//! | `default_requirement` | `main_thread` |
//!
//! ## Thread contracts
//!
//! Each host event type declares where its handlers may run. The contract is
//! configuration, not code:
//!
//! ```rust
//! use core_runtime::config::{CoreConfig, ThreadRequirement};
//!
//! let config = CoreConfig::from_json(r#"{
//!     "tick_interval_ms": 50,
//!     "event_contracts": {
//!         "player_joined": "main_thread",
//!         "async_chat": "anywhere"
//!     }
//! }"#).unwrap();
//!
//! assert_eq!(config.requirement_for("async_chat"), ThreadRequirement::Anywhere);
//! assert_eq!(config.requirement_for("unknown"), ThreadRequirement::MainThread);
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::CoreConfig;
//!
//! let config = CoreConfig::builder()
//!     .worker_threads(0)
//!     .build()
//!     .expect("Should fail - no worker threads");
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Where handlers for a given host event are allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadRequirement {
    /// Handlers touch host state and must run on the designated main thread.
    #[default]
    MainThread,
    /// No restriction; handlers run wherever the result becomes available.
    Anywhere,
}

/// How the session is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownStrategy {
    /// The session is disposed automatically when its owner is dropped.
    #[default]
    Scheduler,
    /// The host must call `dispose()` explicitly.
    Manual,
}

/// Core configuration for the dispatch bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// How often the host loop drains the main-thread queue
    pub tick_interval_ms: u64,

    /// Size of the worker runtime used for off-thread work
    pub worker_threads: usize,

    /// Prefix for worker thread names
    pub thread_name_prefix: String,

    /// Identity of the designated main thread
    pub main_thread_name: String,

    /// Lifetime of a resolved cache entry; `None` keeps entries until invalidated
    pub cache_ttl_ms: Option<u64>,

    /// Remove failed fetches from the cache once settled so the next call retries
    pub evict_failures: bool,

    /// Optional deadline applied to adapter fetches
    pub fetch_timeout_ms: Option<u64>,

    /// Session teardown strategy
    pub shutdown_strategy: ShutdownStrategy,

    /// Per-event thread requirements, keyed by event name
    pub event_contracts: HashMap<String, ThreadRequirement>,

    /// Requirement for events without an explicit contract
    pub default_requirement: ThreadRequirement,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 16,
            worker_threads: 4,
            thread_name_prefix: "affinity-worker".to_string(),
            main_thread_name: "server-main".to_string(),
            cache_ttl_ms: None,
            evict_failures: true,
            fetch_timeout_ms: None,
            shutdown_strategy: ShutdownStrategy::default(),
            event_contracts: HashMap::new(),
            default_requirement: ThreadRequirement::default(),
        }
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Parses and validates a JSON configuration document.
    pub fn from_json(document: &str) -> Result<Self> {
        let config: CoreConfig = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(invalid(
                "tick_interval_ms",
                "must be greater than zero; the main-thread queue would never be drained",
            ));
        }

        if self.worker_threads == 0 {
            return Err(invalid(
                "worker_threads",
                "must be at least 1; off-thread fetches need a worker",
            ));
        }

        if self.thread_name_prefix.trim().is_empty() {
            return Err(invalid("thread_name_prefix", "must not be empty"));
        }

        if self.main_thread_name.trim().is_empty() {
            return Err(invalid("main_thread_name", "must not be empty"));
        }

        if self.cache_ttl_ms == Some(0) {
            return Err(invalid(
                "cache_ttl_ms",
                "a zero TTL disables coalescing of resolved entries; omit it instead",
            ));
        }

        if self.fetch_timeout_ms == Some(0) {
            return Err(invalid("fetch_timeout_ms", "must be greater than zero"));
        }

        if let Some(name) = self.event_contracts.keys().find(|k| k.trim().is_empty()) {
            return Err(Error::Config(format!(
                "Event contract names must not be empty (got {:?})",
                name
            )));
        }

        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_ms.map(Duration::from_millis)
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }

    /// Thread requirement declared for `event`, or the default.
    pub fn requirement_for(&self, event: &str) -> ThreadRequirement {
        self.event_contracts
            .get(event)
            .copied()
            .unwrap_or(self.default_requirement)
    }
}

fn invalid(field: &str, message: &str) -> Error {
    Error::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Milliseconds in `duration`, rounded up so that a non-zero duration never
/// becomes zero.
fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}

/// Builder for constructing a [`CoreConfig`].
#[derive(Debug, Default)]
pub struct CoreConfigBuilder {
    config: CoreConfig,
}

impl CoreConfigBuilder {
    /// Sets the host tick interval.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval_ms = whole_millis(interval);
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads;
        self
    }

    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn main_thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.main_thread_name = name.into();
        self
    }

    /// Sets how long resolved cache entries stay valid.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl_ms = Some(whole_millis(ttl));
        self
    }

    pub fn evict_failures(mut self, evict: bool) -> Self {
        self.config.evict_failures = evict;
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_timeout_ms = Some(whole_millis(timeout));
        self
    }

    pub fn shutdown_strategy(mut self, strategy: ShutdownStrategy) -> Self {
        self.config.shutdown_strategy = strategy;
        self
    }

    /// Declares where handlers for `event` must run.
    pub fn event_contract(mut self, event: impl Into<String>, requirement: ThreadRequirement) -> Self {
        self.config.event_contracts.insert(event.into(), requirement);
        self
    }

    pub fn default_requirement(mut self, requirement: ThreadRequirement) -> Self {
        self.config.default_requirement = requirement;
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] when a value fails validation.
    pub fn build(self) -> Result<CoreConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
