//! Sliding window log: exact enforcement over a trailing window.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::algorithm::{positive_count, positive_window, Algorithm};
use super::verdict::Verdict;
use crate::clock::Timestamp;
use crate::error::Result;

/// Sliding window log configuration.
///
/// Keeps the timestamp of every admission inside the trailing window, so no
/// interval of length `window` ever contains more than `limit` admissions.
/// Memory per identifier is `O(limit)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlidingWindowLog {
    limit: u64,
    window: Duration,
}

/// Per-identifier log of admission timestamps, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogState {
    pub entries: VecDeque<Timestamp>,
}

impl SlidingWindowLog {
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        Ok(Self {
            limit: positive_count("limit", limit)?,
            window: positive_window(window)?,
        })
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn evict_expired(&self, state: &mut LogState, now: Timestamp) {
        while let Some(oldest) = state.entries.front() {
            if now.saturating_since(*oldest) < self.window {
                break;
            }
            state.entries.pop_front();
        }
    }
}

impl Algorithm for SlidingWindowLog {
    type State = LogState;

    fn name(&self) -> &'static str {
        "sliding_log"
    }

    fn limit(&self) -> u64 {
        self.limit
    }

    fn initial_state(&self, _now: Timestamp) -> LogState {
        LogState::default()
    }

    fn decide(&self, state: &mut LogState, now: Timestamp) -> Verdict {
        self.evict_expired(state, now);

        let len = state.entries.len() as u64;
        if len < self.limit {
            // Keep the log ordered even if a caller's clock lags the newest entry
            let entry = state.entries.back().map_or(now, |newest| now.max(*newest));
            state.entries.push_back(entry);
            return Verdict::allow(self.limit, self.limit - len - 1, Some(entry + self.window));
        }

        // One slot frees when the oldest entry leaves; the whole quota once
        // the newest does
        let oldest = state.entries.front().copied().unwrap_or(now);
        let newest = state.entries.back().copied().unwrap_or(now);
        let retry_after = self.window.saturating_sub(now.saturating_since(oldest));
        Verdict::deny(self.limit, Some(newest + self.window), Some(retry_after))
    }

    fn is_idle(&self, state: &LogState, now: Timestamp) -> bool {
        state
            .entries
            .back()
            .map_or(true, |newest| now.saturating_since(*newest) >= self.window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(millis: u64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    #[test]
    fn test_invalid_configuration_rejected() {
        assert!(SlidingWindowLog::new(0, Duration::from_secs(1)).is_err());
        assert!(SlidingWindowLog::new(1, Duration::ZERO).is_err());
    }

    #[test]
    fn test_denies_until_oldest_expires() {
        let log = SlidingWindowLog::new(2, Duration::from_secs(10)).unwrap();
        let mut state = log.initial_state(at(0));

        assert!(log.decide(&mut state, at(0)).allowed);
        assert!(log.decide(&mut state, at(4_000)).allowed);

        let denied = log.decide(&mut state, at(6_000));
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(4)));
        assert_eq!(denied.reset_at, Some(at(14_000)));

        // The entry from t=0 leaves the window at exactly t=10
        assert!(log.decide(&mut state, at(10_000)).allowed);
        assert!(!log.decide(&mut state, at(10_500)).allowed);
        assert_eq!(state.entries.len(), 2);
    }

    #[test]
    fn test_reset_at_is_full_restoration() {
        let log = SlidingWindowLog::new(3, Duration::from_secs(10)).unwrap();
        let mut state = log.initial_state(at(0));

        assert_eq!(log.decide(&mut state, at(0)).reset_at, Some(at(10_000)));
        let verdict = log.decide(&mut state, at(3_000));
        assert_eq!(verdict.reset_at, Some(at(13_000)));
        assert_eq!(verdict.remaining, 1);

        // Nothing in the log is left once the newest entry expires
        assert!(log.is_idle(&state, at(13_000)));
        assert!(!log.is_idle(&state, at(12_999)));
    }

    #[test]
    fn test_no_boundary_burst() {
        let log = SlidingWindowLog::new(5, Duration::from_secs(60)).unwrap();
        let mut state = log.initial_state(at(0));

        let late = (0..5).filter(|_| log.decide(&mut state, at(59_000)).allowed).count();
        let early = (0..5).filter(|_| log.decide(&mut state, at(60_000)).allowed).count();
        assert_eq!(late, 5);
        assert_eq!(early, 0);
    }

    #[test]
    fn test_trailing_window_never_exceeds_limit() {
        let limit = 4;
        let window_ms = 1_000;
        let log = SlidingWindowLog::new(limit, Duration::from_millis(window_ms)).unwrap();
        let mut state = log.initial_state(at(0));

        let mut admitted = Vec::new();
        let mut t = 0u64;
        for step in 0..500u64 {
            if log.decide(&mut state, at(t)).allowed {
                admitted.push(t);
            }
            t += (step * 37) % 150;
        }

        for (i, start) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|&&ts| ts - start < window_ms)
                .count();
            assert!(in_window as u64 <= limit, "{in_window} admissions after {start}ms");
        }
    }

    #[test]
    fn test_log_stays_ordered_when_clock_lags() {
        let log = SlidingWindowLog::new(3, Duration::from_secs(5)).unwrap();
        let mut state = log.initial_state(at(0));
        log.decide(&mut state, at(2_000));
        log.decide(&mut state, at(1_000));

        let entries: Vec<_> = state.entries.iter().copied().collect();
        assert_eq!(entries, vec![at(2_000), at(2_000)]);
    }

    #[test]
    fn test_idle_when_all_entries_expired() {
        let log = SlidingWindowLog::new(3, Duration::from_secs(1)).unwrap();
        let mut state = log.initial_state(at(0));
        assert!(log.is_idle(&state, at(0)));

        log.decide(&mut state, at(0));
        log.decide(&mut state, at(500));
        assert!(!log.is_idle(&state, at(1_200)));
        assert!(log.is_idle(&state, at(1_500)));
    }
}
