use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{core::crypto::MsSinceEpoch, ext::serde::duration_secs};

/// A shared counter store whose entries expire on their own.
pub trait TtlCache: Send + Sync {
    fn get(&self, key: &str, now: MsSinceEpoch) -> Option<u64>;
    fn put(&self, key: &str, value: u64, ttl: Duration, now: MsSinceEpoch);
    fn remove(&self, key: &str);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub enabled: bool,
    pub allowed_fails: u64,
    /// How long a failure is remembered.
    #[serde(with = "duration_secs")]
    pub block_window: Duration,
    /// How long a blocked request is held before it is rejected.
    #[serde(with = "duration_secs")]
    pub block_delay: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_fails: 5,
            block_window: Duration::from_secs(300),
            block_delay: Duration::from_secs(3),
        }
    }
}

/// Counts failures per source address and blocks noisy sources.
pub struct BruteForceGuard<C> {
    cache: C,
    config: GuardConfig,
}

impl<C> BruteForceGuard<C>
where
    C: TtlCache,
{
    pub fn new(cache: C, config: GuardConfig) -> Self {
        Self { cache, config }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn failures(&self, source: &str, now: MsSinceEpoch) -> u64 {
        self.cache.get(source, now).unwrap_or(0)
    }

    pub fn is_blocked(&self, source: &str, now: MsSinceEpoch) -> bool {
        if !self.config.enabled {
            return false;
        }
        let blocked = self.failures(source, now) >= self.config.allowed_fails;
        if blocked {
            info!(
                source,
                window = self.config.block_window.as_secs(),
                "access from source is blocked since last fail"
            );
        }
        blocked
    }

    /// Increments the counter and restarts its window.
    pub fn record_failure(&self, source: &str, now: MsSinceEpoch) {
        let fails = self.failures(source, now) + 1;
        debug!(source, fails, "recording failed attempt");
        self.cache.put(source, fails, self.config.block_window, now);
    }

    pub fn clear(&self, source: &str) {
        self.cache.remove(source);
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{core::crypto::MsSinceEpoch, memory::MemoryCache};

    use super::{BruteForceGuard, GuardConfig};

    fn guard() -> BruteForceGuard<MemoryCache> {
        BruteForceGuard::new(MemoryCache::default(), GuardConfig::default())
    }

    #[test]
    pub fn test_threshold_and_clear() {
        let guard = guard();
        let now = MsSinceEpoch::from_seconds(1000);
        for _ in 0..4 {
            guard.record_failure("10.0.0.1", now);
        }
        assert!(!guard.is_blocked("10.0.0.1", now));
        guard.record_failure("10.0.0.1", now);
        assert!(guard.is_blocked("10.0.0.1", now));
        assert!(!guard.is_blocked("10.0.0.2", now));

        guard.clear("10.0.0.1");
        assert!(!guard.is_blocked("10.0.0.1", now));
        assert_eq!(guard.failures("10.0.0.1", now), 0);
    }

    #[test]
    pub fn test_window_expires_and_restarts() {
        let guard = guard();
        let start = MsSinceEpoch::from_seconds(0);
        for i in 0..5 {
            guard.record_failure("s", start.after(Duration::from_secs(i * 100)));
        }
        // The last failure at 400s restarted the window.
        assert!(guard.is_blocked("s", MsSinceEpoch::from_seconds(699)));
        assert!(!guard.is_blocked("s", MsSinceEpoch::from_seconds(700)));
    }

    #[test]
    pub fn test_disabled_never_blocks() {
        let guard = BruteForceGuard::new(
            MemoryCache::default(),
            GuardConfig { enabled: false, ..GuardConfig::default() },
        );
        let now = MsSinceEpoch(0);
        for _ in 0..10 {
            guard.record_failure("s", now);
        }
        assert!(!guard.is_blocked("s", now));
        assert_eq!(guard.failures("s", now), 10);
    }
}
