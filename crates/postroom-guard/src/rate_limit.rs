//! Fixed-window request rate limiting.
//!
//! Process-local and in-memory: the limiter exists to blunt
//! form-submission abuse, not to meter anything billable. Each key gets
//! a counter that resets on a fixed window boundary; expired windows are
//! swept opportunistically on every check instead of by a background
//! task. State is lost on restart, which is acceptable for this purpose.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use postroom_core::Clock;

/// Verdict for a single rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests left in the current window after this one.
    pub remaining: u32,
    /// When the current window resets, milliseconds since the epoch.
    pub reset_at_ms: i64,
}

/// Per-key counter for the current window.
#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at_ms: i64,
}

/// In-memory fixed-window rate limiter.
///
/// A saturated window rejects further increments rather than clamping,
/// so `remaining` in a rejection is always zero. The fixed-window shape
/// admits a burst of up to twice the limit across a window boundary;
/// that trade buys O(1) memory per active key and no background thread.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, Window>>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Creates an empty limiter driven by the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { windows: Arc::new(Mutex::new(HashMap::new())), clock }
    }

    /// Checks and, when allowed, consumes one request for `key`.
    ///
    /// Never fails. Expired windows across the whole key space are
    /// dropped first, which bounds memory to keys active within the last
    /// window even under key-enumeration abuse.
    pub fn check(&self, key: &str, limit: u32, window: Duration) -> RateDecision {
        let now_ms = self.clock.now_utc().timestamp_millis();
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);

        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            // A poisoned lock only means another check panicked mid-map
            // access; the map itself is still a valid counter table.
            Err(poisoned) => poisoned.into_inner(),
        };

        windows.retain(|_, w| w.reset_at_ms > now_ms);

        let entry = windows
            .entry(key.to_string())
            .or_insert(Window { count: 0, reset_at_ms: now_ms.saturating_add(window_ms) });

        if entry.count >= limit {
            tracing::debug!(key, limit, "rate limit exceeded");
            return RateDecision { allowed: false, remaining: 0, reset_at_ms: entry.reset_at_ms };
        }

        entry.count += 1;
        RateDecision {
            allowed: true,
            remaining: limit - entry.count,
            reset_at_ms: entry.reset_at_ms,
        }
    }

    /// Number of keys currently tracked. Diagnostic only.
    pub fn tracked_keys(&self) -> usize {
        match self.windows.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use postroom_core::TestClock;

    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    fn limiter() -> (RateLimiter, Arc<TestClock>) {
        let clock =
            Arc::new(TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(1_700_000_000)));
        (RateLimiter::new(clock.clone()), clock)
    }

    #[test]
    fn fresh_key_counts_down_then_saturates() {
        let (limiter, _clock) = limiter();
        let limit = 5;

        for expected_remaining in (0..limit).rev() {
            let decision = limiter.check("form:contact:1.2.3.4", limit, WINDOW);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let rejected = limiter.check("form:contact:1.2.3.4", limit, WINDOW);
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
    }

    #[test]
    fn rejection_does_not_consume_budget() {
        let (limiter, clock) = limiter();

        limiter.check("k", 1, WINDOW);
        for _ in 0..10 {
            assert!(!limiter.check("k", 1, WINDOW).allowed);
        }

        // Budget returns in full after the window resets.
        clock.advance(WINDOW);
        assert!(limiter.check("k", 1, WINDOW).allowed);
    }

    #[test]
    fn window_reset_restores_allowance() {
        let (limiter, clock) = limiter();

        let first = limiter.check("k", 2, WINDOW);
        assert!(first.allowed);
        assert!(limiter.check("k", 2, WINDOW).allowed);
        assert!(!limiter.check("k", 2, WINDOW).allowed);

        clock.advance(WINDOW - Duration::from_millis(1));
        assert!(!limiter.check("k", 2, WINDOW).allowed);

        clock.advance(Duration::from_millis(1));
        let after_reset = limiter.check("k", 2, WINDOW);
        assert!(after_reset.allowed);
        assert_eq!(after_reset.remaining, 1);
        assert!(after_reset.reset_at_ms > first.reset_at_ms);
    }

    #[test]
    fn keys_are_independent() {
        let (limiter, _clock) = limiter();

        assert!(limiter.check("a", 1, WINDOW).allowed);
        assert!(!limiter.check("a", 1, WINDOW).allowed);
        assert!(limiter.check("b", 1, WINDOW).allowed);
    }

    #[test]
    fn sweep_drops_expired_keys() {
        let (limiter, clock) = limiter();

        for i in 0..100 {
            limiter.check(&format!("attacker-{i}"), 3, WINDOW);
        }
        assert_eq!(limiter.tracked_keys(), 100);

        clock.advance(WINDOW);
        limiter.check("fresh", 3, WINDOW);
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
