//! Sliding window counter: two adjacent fixed windows with weighted
//! interpolation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::algorithm::{positive_count, positive_window, secs, Algorithm};
use super::verdict::Verdict;
use crate::clock::Timestamp;
use crate::error::Result;

/// Sliding window counter configuration.
///
/// Approximates a sliding window log in `O(1)` memory. The estimated count
/// is `current + previous × (1 − f)` where `f` is the fraction of the current
/// window that has elapsed on the clock. Windows are aligned to multiples of
/// `window` since the epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlidingWindowCounter {
    limit: u64,
    window: Duration,
}

/// Per-identifier pair of window counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterPairState {
    pub current_count: u64,
    /// Count of the window immediately preceding the current one
    pub previous_count: u64,
    pub current_window_start: Timestamp,
}

impl SlidingWindowCounter {
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        Ok(Self {
            limit: positive_count("limit", limit)?,
            window: positive_window(window)?,
        })
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn roll(&self, state: &mut CounterPairState, now: Timestamp) {
        let start = now.floor_to(self.window);
        if start <= state.current_window_start {
            return;
        }
        state.previous_count = if start == state.current_window_start + self.window {
            state.current_count
        } else {
            0
        };
        state.current_count = 0;
        state.current_window_start = start;
    }

    fn elapsed_fraction(&self, state: &CounterPairState, now: Timestamp) -> f64 {
        let elapsed = now.saturating_since(state.current_window_start).as_secs_f64();
        (elapsed / self.window.as_secs_f64()).clamp(0.0, 1.0)
    }

    /// Weighted request count for the trailing window ending at `now`.
    pub fn estimate(&self, state: &CounterPairState, now: Timestamp) -> f64 {
        let weight = 1.0 - self.elapsed_fraction(state, now);
        state.current_count as f64 + state.previous_count as f64 * weight
    }

    fn admits_at(&self, state: &CounterPairState, at: Timestamp) -> bool {
        let mut projected = state.clone();
        self.roll(&mut projected, at);
        self.estimate(&projected, at) < self.limit as f64
    }

    /// When the estimate reaches zero: the current window's count still
    /// weighs in for one window after it closes.
    fn restored_at(&self, state: &CounterPairState) -> Timestamp {
        if state.current_count > 0 {
            state.current_window_start + self.window * 2
        } else {
            state.current_window_start + self.window
        }
    }

    /// Time until a decision would be admitted.
    fn retry_after(&self, state: &CounterPairState, now: Timestamp) -> Duration {
        let limit = self.limit as f64;
        let current = state.current_count as f64;
        let previous = state.previous_count as f64;
        let window = self.window.as_secs_f64();
        let elapsed = now.saturating_since(state.current_window_start).as_secs_f64();

        let wait_until = if current < limit && previous > 0.0 {
            // The previous window's weight has to shrink far enough
            (1.0 - (limit - current) / previous) * window
        } else {
            // The current window alone saturates; once it becomes the previous
            // window its weight has to shrink instead
            window + (1.0 - limit / current).max(0.0) * window
        };

        // The analytic crossing is where the estimate equals the limit, which
        // is still a denial; step just past it
        let mut wait = secs(wait_until - elapsed);
        let mut step = Duration::from_nanos(1);
        while !self.admits_at(state, now + wait) && step < self.window {
            wait += step;
            step *= 2;
        }
        wait
    }
}

impl Algorithm for SlidingWindowCounter {
    type State = CounterPairState;

    fn name(&self) -> &'static str {
        "sliding_window"
    }

    fn limit(&self) -> u64 {
        self.limit
    }

    fn initial_state(&self, now: Timestamp) -> CounterPairState {
        CounterPairState {
            current_count: 0,
            previous_count: 0,
            current_window_start: now.floor_to(self.window),
        }
    }

    fn decide(&self, state: &mut CounterPairState, now: Timestamp) -> Verdict {
        self.roll(state, now);

        let estimate = self.estimate(state, now);
        let limit = self.limit as f64;

        if estimate < limit {
            state.current_count += 1;
            let remaining = (limit - estimate - 1.0).max(0.0).floor() as u64;
            return Verdict::allow(self.limit, remaining, Some(self.restored_at(state)));
        }

        Verdict::deny(
            self.limit,
            Some(self.restored_at(state)),
            Some(self.retry_after(state, now)),
        )
    }

    fn is_idle(&self, state: &CounterPairState, now: Timestamp) -> bool {
        let mut projected = state.clone();
        self.roll(&mut projected, now);
        projected.current_count == 0 && projected.previous_count == 0
    }
}
