//! Clock abstraction for deterministic time control.
//!
//! Everything time-sensitive in the pipeline (token expiry, rate windows,
//! leases, backoff) takes a clock rather than reading ambient time, so
//! tests can drive minutes of virtual time in microseconds.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

/// Injectable time source.
///
/// Production wiring uses [`RealClock`]; tests inject [`TestClock`] and
/// advance it explicitly.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Current wall-clock time for timestamps.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the given duration.
    ///
    /// Real clocks await tokio's timer; test clocks advance virtual time
    /// and yield immediately.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Current wall-clock time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }
}

/// Production clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually advanced clock for tests.
///
/// Monotonic and wall-clock time are tracked separately: `advance` moves
/// both forward, while `jump_to` may move wall-clock time backwards
/// without disturbing the monotonic reading.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Monotonic nanoseconds since clock creation.
    monotonic_ns: Arc<AtomicU64>,
    /// Wall-clock nanoseconds since UNIX_EPOCH.
    system_ns: Arc<AtomicU64>,
    /// Anchor for reconstructing `Instant` values.
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a test clock starting at a specific wall-clock time.
    pub fn with_start_time(start: SystemTime) -> Self {
        let since_epoch = start.duration_since(UNIX_EPOCH).unwrap_or_default();

        Self {
            monotonic_ns: Arc::new(AtomicU64::new(0)),
            system_ns: Arc::new(AtomicU64::new(saturating_ns(since_epoch))),
            base_instant: Instant::now(),
        }
    }

    /// Advances both monotonic and wall-clock time.
    pub fn advance(&self, duration: Duration) {
        let ns = saturating_ns(duration);
        self.monotonic_ns.fetch_add(ns, Ordering::AcqRel);
        self.system_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Jumps wall-clock time to a specific point.
    ///
    /// Forward jumps also advance monotonic time; backward jumps only
    /// move the wall clock.
    pub fn jump_to(&self, time: SystemTime) {
        let target_ns = saturating_ns(time.duration_since(UNIX_EPOCH).unwrap_or_default());
        let current_ns = self.system_ns.load(Ordering::Acquire);

        if target_ns > current_ns {
            self.advance(Duration::from_nanos(target_ns - current_ns));
        } else {
            self.system_ns.store(target_ns, Ordering::Release);
        }
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.system_ns.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

fn saturating_ns(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos().min(u128::from(u64::MAX))).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_monotonic_time() {
        let clock = TestClock::new();
        let start = clock.now();

        clock.advance(Duration::from_secs(10));

        assert_eq!(clock.now().duration_since(start), Duration::from_secs(10));
    }

    #[test]
    fn wall_clock_tracks_start_time() {
        let start = UNIX_EPOCH + Duration::from_secs(1000);
        let clock = TestClock::with_start_time(start);

        assert_eq!(clock.now_system(), start);

        clock.advance(Duration::from_secs(60));
        assert_eq!(clock.now_system(), start + Duration::from_secs(60));
    }

    #[test]
    fn backward_jump_leaves_monotonic_time_alone() {
        let clock = TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(5000));
        clock.advance(Duration::from_secs(10));

        clock.jump_to(UNIX_EPOCH + Duration::from_secs(100));

        assert_eq!(clock.now_system(), UNIX_EPOCH + Duration::from_secs(100));
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn now_utc_follows_system_time() {
        let start = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let clock = TestClock::with_start_time(start);

        assert_eq!(clock.now_utc().timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn sleep_advances_virtual_time() {
        let clock = TestClock::new();
        let start = clock.now();

        clock.sleep(Duration::from_secs(5)).await;

        assert_eq!(clock.now().duration_since(start), Duration::from_secs(5));
    }
}
