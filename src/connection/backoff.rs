//! Reconnect backoff policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay after the first failed attempt
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor per consecutive failure
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl ReconnectPolicy {
    /// A policy with a fixed delay, handy for tests.
    pub fn constant(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            initial_backoff_ms: ms,
            max_backoff_ms: ms,
            multiplier: 1.0,
        }
    }

    /// Delay before retrying after `attempt` consecutive failures (1-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1).min(64) as i32);
        let ms = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.backoff_for_attempt(20), Duration::from_secs(30));
        assert_eq!(policy.backoff_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_constant_policy() {
        let policy = ReconnectPolicy::constant(Duration::from_millis(5));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(5));
        assert_eq!(policy.backoff_for_attempt(10), Duration::from_millis(5));
    }
}
