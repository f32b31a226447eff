//! Bounded retry with exponential backoff for transient storage failures

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::RewardsError;

/// How often, and how patiently, a unit of work is retried
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    10
}

fn default_max_backoff_ms() -> u64 {
    250
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Run `op`, retrying transient failures. Blocks the calling thread
    /// while backing off.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T, RewardsError>
    where
        F: FnMut() -> Result<T, RewardsError>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.backoff(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "{} failed, retrying", what);
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        error!(attempts, error = %e, "{} failed, retries exhausted", what);
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn busy() -> RewardsError {
        RewardsError::Persistence {
            transient: true,
            message: "database is locked".into(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
        assert_eq!(policy.backoff(10), Duration::from_millis(250));
        assert_eq!(policy.backoff(200), Duration::from_millis(250));
    }

    #[test]
    fn test_transient_failure_recovers() {
        let calls = Cell::new(0);
        let result = RetryPolicy::default().run("test op", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(busy())
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retries_exhaust() {
        let calls = Cell::new(0);
        let result: Result<(), _> = RetryPolicy::default().run("test op", || {
            calls.set(calls.get() + 1);
            Err(busy())
        });
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_permanent_failure_is_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = RetryPolicy::default().run("test op", || {
            calls.set(calls.get() + 1);
            Err(RewardsError::Internal("broken".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
