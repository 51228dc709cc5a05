//! Time sources for limiter decisions.
//!
//! Every decision is evaluated against a [`Timestamp`], a duration since the
//! Unix epoch. The production clock reads a monotonic [`Instant`] and anchors
//! it to UTC once, so refill and window arithmetic never runs backwards when
//! the system clock is adjusted.

use std::fmt;
use std::ops::Add;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A point in time, expressed as the duration elapsed since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(Duration);

impl Timestamp {
    /// The Unix epoch.
    pub const EPOCH: Timestamp = Timestamp(Duration::ZERO);

    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    /// Build a timestamp from fractional seconds. Negative or non-finite
    /// input collapses to the epoch.
    pub fn from_secs_f64(secs: f64) -> Self {
        Self(Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO))
    }

    /// Duration since the Unix epoch.
    pub fn since_epoch(&self) -> Duration {
        self.0
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0.as_secs_f64()
    }

    /// Time elapsed since `earlier`, or zero if `earlier` is in the future.
    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        self.0.saturating_sub(earlier.0)
    }

    /// Start of the `window`-sized epoch-aligned interval containing `self`.
    pub fn floor_to(&self, window: Duration) -> Timestamp {
        let window_nanos = window.as_nanos();
        if window_nanos == 0 {
            return *self;
        }
        let floored = self.0.as_nanos() / window_nanos * window_nanos;
        Timestamp(Duration::new(
            (floored / 1_000_000_000) as u64,
            (floored % 1_000_000_000) as u32,
        ))
    }

    /// Whole epoch seconds, rounded up.
    pub fn epoch_secs_ceil(&self) -> u64 {
        let secs = self.0.as_secs();
        if self.0.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.as_secs_f64())
    }
}

/// A source of the current time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time. Successive calls never go backwards.
    fn now(&self) -> Timestamp;
}

/// Monotonic clock anchored to UTC at construction.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
    origin_since_epoch: Duration,
}

impl MonotonicClock {
    pub fn new() -> Self {
        let wall = chrono::Utc::now();
        let origin_since_epoch = Duration::new(
            wall.timestamp().max(0) as u64,
            wall.timestamp_subsec_nanos(),
        );
        Self {
            origin: Instant::now(),
            origin_since_epoch,
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.origin_since_epoch + self.origin.elapsed())
    }
}

/// A manually driven clock for deterministic tests and simulations.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Timestamp>>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn at_secs(secs: f64) -> Self {
        Self::new(Timestamp::from_secs_f64(secs))
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }

    /// Jump to `to`. Moving backwards is ignored.
    pub fn set(&self, to: Timestamp) {
        let mut now = self.now.lock();
        if to > *now {
            *now = to;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_to_window() {
        let ts = Timestamp::from_secs_f64(125.5);
        assert_eq!(ts.floor_to(Duration::from_secs(60)), Timestamp::from_secs(120));
        assert_eq!(ts.floor_to(Duration::ZERO), ts);
    }

    #[test]
    fn test_epoch_secs_ceil() {
        assert_eq!(Timestamp::from_secs(60).epoch_secs_ceil(), 60);
        assert_eq!(Timestamp::from_millis(60_001).epoch_secs_ceil(), 61);
    }

    #[test]
    fn test_saturating_since() {
        let a = Timestamp::from_secs(10);
        let b = Timestamp::from_secs(12);
        assert_eq!(b.saturating_since(a), Duration::from_secs(2));
        assert_eq!(a.saturating_since(b), Duration::ZERO);
    }

    #[test]
    fn test_from_secs_f64_rejects_negative() {
        assert_eq!(Timestamp::from_secs_f64(-3.0), Timestamp::EPOCH);
        assert_eq!(Timestamp::from_secs_f64(f64::NAN), Timestamp::EPOCH);
    }

    #[test]
    fn test_monotonic_clock_never_goes_backwards() {
        let clock = MonotonicClock::new();
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
        // Anchored to wall time, not to zero
        assert!(first.since_epoch() > Duration::from_secs(1_600_000_000));
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::at_secs(0.0);
        let other = clock.clone();
        clock.advance(Duration::from_secs(5));
        assert_eq!(other.now(), Timestamp::from_secs(5));

        other.set(Timestamp::from_secs(2));
        assert_eq!(clock.now(), Timestamp::from_secs(5));
    }
}
