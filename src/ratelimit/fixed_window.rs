//! Fixed window counter.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::algorithm::{positive_count, positive_window, Algorithm};
use super::verdict::Verdict;
use crate::clock::Timestamp;
use crate::error::Result;

/// Where a new fixed window starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowAlignment {
    /// The window opens at the first request after the previous one expired.
    #[default]
    FirstRequest,
    /// Windows are aligned to multiples of the window size since the epoch
    /// (e.g. wall-clock minute marks).
    Epoch,
}

/// Fixed window counter configuration.
///
/// Up to `limit` requests are admitted per window. Requests clustered at the
/// end of one window and the start of the next can reach `2 × limit` within
/// a single window's length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedWindow {
    limit: u64,
    window: Duration,
    alignment: WindowAlignment,
}

/// Per-identifier fixed window state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowState {
    /// Admissions in the current window
    pub count: u64,
    /// When the current window opened
    pub window_start: Timestamp,
}

impl FixedWindow {
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        Ok(Self {
            limit: positive_count("limit", limit)?,
            window: positive_window(window)?,
            alignment: WindowAlignment::default(),
        })
    }

    pub fn with_alignment(mut self, alignment: WindowAlignment) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn alignment(&self) -> WindowAlignment {
        self.alignment
    }

    fn window_start_for(&self, now: Timestamp) -> Timestamp {
        match self.alignment {
            WindowAlignment::FirstRequest => now,
            WindowAlignment::Epoch => now.floor_to(self.window),
        }
    }

    fn expired(&self, state: &WindowState, now: Timestamp) -> bool {
        now.saturating_since(state.window_start) >= self.window
    }
}

impl Algorithm for FixedWindow {
    type State = WindowState;

    fn name(&self) -> &'static str {
        "fixed_window"
    }

    fn limit(&self) -> u64 {
        self.limit
    }

    fn initial_state(&self, now: Timestamp) -> WindowState {
        WindowState {
            count: 0,
            window_start: self.window_start_for(now),
        }
    }

    fn decide(&self, state: &mut WindowState, now: Timestamp) -> Verdict {
        if self.expired(state, now) {
            state.count = 0;
            state.window_start = self.window_start_for(now);
        }

        let reset_at = state.window_start + self.window;
        if state.count < self.limit {
            state.count += 1;
            return Verdict::allow(self.limit, self.limit - state.count, Some(reset_at));
        }

        Verdict::deny(
            self.limit,
            Some(reset_at),
            Some(reset_at.saturating_since(now)),
        )
    }

    fn is_idle(&self, state: &WindowState, now: Timestamp) -> bool {
        state.count == 0 || self.expired(state, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> Timestamp {
        Timestamp::from_secs(secs)
    }

    #[test]
    fn test_invalid_configuration_rejected() {
        assert!(FixedWindow::new(0, Duration::from_secs(1)).is_err());
        assert!(FixedWindow::new(1, Duration::ZERO).is_err());
    }

    #[test]
    fn test_limit_two_per_minute() {
        let window = FixedWindow::new(2, Duration::from_secs(60)).unwrap();
        let mut state = window.initial_state(at(0));

        assert!(window.decide(&mut state, at(0)).allowed);
        assert!(window.decide(&mut state, at(1)).allowed);

        let denied = window.decide(&mut state, at(2));
        assert!(!denied.allowed);
        assert_eq!(denied.reset_at, Some(at(60)));
        assert_eq!(denied.reset_at_epoch_secs(), Some(60));
        assert_eq!(denied.retry_after, Some(Duration::from_secs(58)));

        let verdict = window.decide(&mut state, at(61));
        assert!(verdict.allowed);
        assert_eq!(verdict.reset_at, Some(at(121)));
    }

    #[test]
    fn test_exactly_limit_per_window() {
        let window = FixedWindow::new(10, Duration::from_secs(10)).unwrap();
        let mut state = window.initial_state(at(100));

        let admitted = (0..30)
            .filter(|i| window.decide(&mut state, Timestamp::from_millis(100_000 + i * 300)).allowed)
            .count();
        assert_eq!(admitted, 10);
    }

    #[test]
    fn test_remaining_counts_down() {
        let window = FixedWindow::new(3, Duration::from_secs(1)).unwrap();
        let mut state = window.initial_state(at(0));
        let remaining: Vec<u64> = (0..4)
            .map(|_| window.decide(&mut state, at(0)).remaining)
            .collect();
        assert_eq!(remaining, vec![2, 1, 0, 0]);
    }

    #[test]
    fn test_epoch_alignment_uses_boundaries() {
        let window = FixedWindow::new(1, Duration::from_secs(60))
            .unwrap()
            .with_alignment(WindowAlignment::Epoch);
        let mut state = window.initial_state(at(75));

        assert_eq!(state.window_start, at(60));
        assert!(window.decide(&mut state, at(75)).allowed);

        let denied = window.decide(&mut state, at(110));
        assert!(!denied.allowed);
        assert_eq!(denied.reset_at, Some(at(120)));

        // First-request alignment would still be inside its window here
        assert!(window.decide(&mut state, at(121)).allowed);
        assert_eq!(state.window_start, at(120));
    }

    #[test]
    fn test_boundary_burst_is_accepted() {
        let window = FixedWindow::new(5, Duration::from_secs(60))
            .unwrap()
            .with_alignment(WindowAlignment::Epoch);
        let mut state = window.initial_state(at(0));

        let late = (0..5).filter(|_| window.decide(&mut state, at(59)).allowed).count();
        let early = (0..5).filter(|_| window.decide(&mut state, at(60)).allowed).count();
        assert_eq!(late + early, 10);
    }

    #[test]
    fn test_idle_after_window_expires() {
        let window = FixedWindow::new(2, Duration::from_secs(30)).unwrap();
        let mut state = window.initial_state(at(0));
        assert!(window.is_idle(&state, at(0)));

        window.decide(&mut state, at(0));
        assert!(!window.is_idle(&state, at(29)));
        assert!(window.is_idle(&state, at(30)));
    }
}
