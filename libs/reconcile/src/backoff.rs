//! Per-key exponential backoff.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

/// Exponential backoff configuration.
///
/// No jitter is applied, so successive delays for one key never decrease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay for the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl BackoffPolicy {
    /// Calculate the delay for the given number of prior failures.
    pub fn delay(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Tracks failures per key and hands out the matching retry delays.
#[derive(Debug, Clone)]
pub struct ItemBackoff<K> {
    policy: BackoffPolicy,

    /// Tracked failures: key -> failures so far.
    failures: HashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> ItemBackoff<K> {
    /// Create a tracker using the given policy.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: HashMap::new(),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying.
    pub fn when(&mut self, key: &K) -> Duration {
        let count = self.failures.entry(key.clone()).or_insert(0);
        let delay = self.policy.delay(*count);
        *count = count.saturating_add(1);
        delay
    }

    /// Number of failures recorded for `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    /// Clear failure tracking for `key` (on success).
    pub fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// The policy in use.
    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }
}
