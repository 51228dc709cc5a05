//! Leaky bucket: a queue level draining at a fixed rate.

use serde::{Deserialize, Serialize};

use super::algorithm::{positive_count, positive_rate, secs, Algorithm, EPSILON};
use super::verdict::Verdict;
use crate::clock::Timestamp;
use crate::error::Result;

/// Leaky bucket configuration.
///
/// Each admission raises the level by one and the level drains continuously
/// at `leak_rate` units per second. Unlike [`TokenBucket`](super::TokenBucket)
/// a fresh bucket starts empty, so the output rate is bounded by the drain
/// rate once the bucket fills.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeakyBucket {
    capacity: u64,
    leak_rate: f64,
}

/// Per-identifier leaky bucket state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakState {
    /// Current fill level, `0 <= level <= capacity`
    pub level: f64,
    /// When the level was last drained
    pub last_leak_at: Timestamp,
}

impl LeakyBucket {
    pub fn new(capacity: u64, leak_rate: f64) -> Result<Self> {
        Ok(Self {
            capacity: positive_count("capacity", capacity)?,
            leak_rate: positive_rate("leak_rate", leak_rate)?,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn leak_rate(&self) -> f64 {
        self.leak_rate
    }

    fn leak(&self, state: &mut LeakState, now: Timestamp) {
        let elapsed = now.saturating_since(state.last_leak_at).as_secs_f64();
        state.level = (state.level - elapsed * self.leak_rate).max(0.0);
        if now > state.last_leak_at {
            state.last_leak_at = now;
        }
    }

    fn drained_at(&self, state: &LeakState, now: Timestamp) -> Timestamp {
        now + secs(state.level / self.leak_rate)
    }
}

impl Algorithm for LeakyBucket {
    type State = LeakState;

    fn name(&self) -> &'static str {
        "leaky_bucket"
    }

    fn limit(&self) -> u64 {
        self.capacity
    }

    fn initial_state(&self, now: Timestamp) -> LeakState {
        LeakState {
            level: 0.0,
            last_leak_at: now,
        }
    }

    fn decide(&self, state: &mut LeakState, now: Timestamp) -> Verdict {
        self.leak(state, now);
        let capacity = self.capacity as f64;

        if state.level + 1.0 <= capacity + EPSILON {
            state.level = (state.level + 1.0).min(capacity);
            let remaining = (capacity - state.level + EPSILON).floor() as u64;
            return Verdict::allow(self.capacity, remaining, Some(self.drained_at(state, now)));
        }

        let retry_after = secs((state.level + 1.0 - capacity) / self.leak_rate);
        Verdict::deny(
            self.capacity,
            Some(self.drained_at(state, now)),
            Some(retry_after),
        )
    }

    fn is_idle(&self, state: &LeakState, now: Timestamp) -> bool {
        let mut projected = state.clone();
        self.leak(&mut projected, now);
        projected.level <= EPSILON
    }
}
