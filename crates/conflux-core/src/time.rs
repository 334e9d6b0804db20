//! Clock abstraction for deterministic timing in tests.
//!
//! Circuit cooldowns, retry delays, and reservation staleness all depend on
//! the current time. Injecting a [`Clock`] lets tests drive those paths
//! without real waiting.

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

/// Time source used by every time-dependent component.
///
/// Production wiring uses [`RealClock`]; tests inject [`TestClock`] and
/// advance it explicitly.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Current system time for timestamps.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the given duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Current time as a `chrono` UTC timestamp.
pub fn now_utc(clock: &dyn Clock) -> DateTime<Utc> {
    DateTime::<Utc>::from(clock.now_system())
}

/// System clock backed by tokio's timer.
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

/// Manually-advanced clock for tests.
///
/// Monotonic and system time move together via [`TestClock::advance`].
/// `sleep` advances the clock immediately and yields, so time-driven loops
/// make progress without wall-clock delay.
#[derive(Debug, Clone)]
pub struct TestClock {
    elapsed_ns: Arc<AtomicU64>,
    system_base_ns: u64,
    instant_base: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current system time.
    pub fn new() -> Self {
        Self::starting_at(SystemTime::now())
    }

    /// Creates a test clock starting at a specific system time.
    pub fn starting_at(start: SystemTime) -> Self {
        let since_epoch = start.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            system_base_ns: u64::try_from(since_epoch.as_nanos()).unwrap_or(u64::MAX),
            instant_base: Instant::now(),
        }
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Elapsed time since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.instant_base + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.system_base_ns) + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
