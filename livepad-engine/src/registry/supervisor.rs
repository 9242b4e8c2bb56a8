//! Bounded restart bookkeeping for crashed or unready workers

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Exponential backoff with a retry cap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Consecutive failures tolerated before a language is marked unavailable
    #[serde(default = "RestartPolicy::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "RestartPolicy::default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "RestartPolicy::default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

impl RestartPolicy {
    fn default_max_attempts() -> u32 {
        3
    }

    fn default_base_delay() -> Duration {
        Duration::from_secs(1)
    }

    fn default_max_delay() -> Duration {
        Duration::from_secs(30)
    }

    /// `min(base * 2^(attempt-1), max)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            base_delay: Self::default_base_delay(),
            max_delay: Self::default_max_delay(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

/// Per-language failure counter
#[derive(Debug)]
pub struct Supervisor {
    policy: RestartPolicy,
    failures: AtomicU32,
}

impl Supervisor {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            failures: AtomicU32::new(0),
        }
    }

    /// Count a failure and decide whether another attempt is allowed
    pub fn record_failure(&self) -> RestartDecision {
        let attempt = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.policy.max_attempts {
            RestartDecision::GiveUp {
                attempts: attempt - 1,
            }
        } else {
            RestartDecision::Retry {
                attempt,
                delay: self.policy.delay_for(attempt),
            }
        }
    }

    /// Called after a successful `ready` or an explicit retry
    pub fn reset(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }
}
