//! Exponential backoff policy

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff: `base * 2^(attempt - 1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 60,
            max_delay_secs: 30 * 60,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            base_delay_secs: base.as_secs(),
            max_delay_secs: max.as_secs(),
        }
    }

    /// Delay before retrying after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let secs = self
            .base_delay_secs
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_secs);
        Duration::from_secs(secs)
    }

    /// Whether failed attempt `attempt` may be followed by another one.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for(3), Duration::from_secs(240));
    }

    #[test]
    fn test_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(10), Duration::from_secs(1800));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(1800));
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(3));
        assert!(!policy.allows_retry(4));
    }
}
