//! Full-jitter exponential backoff.
//!
//! Both retry layers draw their delays from here: the in-call retry loop
//! in the sender and the queue-level reschedule that sets `not_before`
//! after a failed claim cycle. Full jitter keeps a fleet of jobs that
//! failed against the same provider outage from re-synchronizing their
//! retries, which matters because the provider enforces its own account
//! rate limit and a synchronized herd just trades 5xx for 429.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff configuration shared by sender and queue retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial attempt. Zero disables in-call retry.
    pub max_retries: u32,

    /// Base delay for the exponential curve.
    pub base_delay: Duration,

    /// Hard cap on any single delay, jittered or not.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Policy with in-call retries disabled.
    ///
    /// Queue workers use this: the queue's own reschedule-with-backoff
    /// supersedes per-call retries, and stacking the two layers would
    /// compound delays.
    pub fn no_in_call_retries(self) -> Self {
        Self { max_retries: 0, ..self }
    }

    /// Delay before retrying after `attempt` (0-based) failures.
    ///
    /// Full jitter: a uniform draw from zero up to the capped
    /// exponential value, `min(cap, rand(0..1) * base * 2^attempt)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let ceiling = self.unjittered_delay(attempt);
        let jittered = ceiling.mul_f64(rand::rng().random_range(0.0..1.0));
        jittered.min(self.max_delay)
    }

    /// The deterministic ceiling of [`backoff_delay`](Self::backoff_delay)
    /// for a given attempt: `min(cap, base * 2^attempt)`.
    pub fn unjittered_delay(&self, attempt: u32) -> Duration {
        let multiplier = 2_u32.saturating_pow(attempt.min(20));
        let raw = self.base_delay.saturating_mul(multiplier);
        raw.min(self.max_delay)
    }
}
