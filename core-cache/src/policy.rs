//! Cache eviction policy

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use core_runtime::config::CoreConfig;
use serde::{Deserialize, Serialize};

/// When resolved entries stop being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Resolved entries older than this are treated as absent (default: never)
    pub ttl: Option<Duration>,

    /// Remove an entry as soon as its fetch fails, so the next call retries
    /// (default: true)
    pub evict_failures: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: None,
            evict_failures: true,
        }
    }
}

impl CachePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            ttl: config.cache_ttl(),
            evict_failures: config.evict_failures,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Keep failed outcomes cached like successes.
    pub fn cache_failures(mut self) -> Self {
        self.evict_failures = false;
        self
    }

    /// Whether an entry resolved at `resolved_at` has outlived the TTL.
    pub fn is_expired(&self, resolved_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => {
                let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::MAX);
                now.signed_duration_since(resolved_at) >= ttl
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_runtime::config::CoreConfig;

    #[test]
    fn test_defaults() {
        let policy = CachePolicy::default();
        assert_eq!(policy.ttl, None);
        assert!(policy.evict_failures);
    }

    #[test]
    fn test_expiry_boundary() {
        let policy = CachePolicy::new().with_ttl(Duration::from_secs(60));
        let resolved_at = Utc::now();

        assert!(!policy.is_expired(resolved_at, resolved_at + ChronoDuration::seconds(59)));
        assert!(policy.is_expired(resolved_at, resolved_at + ChronoDuration::seconds(60)));
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let policy = CachePolicy::new();
        let resolved_at = Utc::now();
        assert!(!policy.is_expired(resolved_at, resolved_at + ChronoDuration::days(3650)));
    }

    #[test]
    fn test_from_config() {
        let config = CoreConfig::builder()
            .cache_ttl(Duration::from_millis(1_500))
            .evict_failures(false)
            .build()
            .unwrap();
        let policy = CachePolicy::from_config(&config);

        assert_eq!(policy.ttl, Some(Duration::from_millis(1_500)));
        assert!(!policy.evict_failures);
    }
}
