//! Token bucket: a reservoir refilled at a constant rate.

use serde::{Deserialize, Serialize};

use super::algorithm::{positive_count, positive_rate, secs, Algorithm, EPSILON};
use super::verdict::Verdict;
use crate::clock::Timestamp;
use crate::error::Result;

/// Token bucket configuration.
///
/// Allows bursts of up to `capacity` requests while holding the long-run
/// average to `refill_rate` requests per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    capacity: u64,
    refill_rate: f64,
}

/// Per-identifier token bucket state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens currently available, `0 <= tokens <= capacity`
    pub tokens: f64,
    /// When tokens were last added
    pub last_refill_at: Timestamp,
}

impl TokenBucket {
    /// Create a token bucket holding `capacity` tokens and adding
    /// `refill_rate` tokens per second.
    pub fn new(capacity: u64, refill_rate: f64) -> Result<Self> {
        Ok(Self {
            capacity: positive_count("capacity", capacity)?,
            refill_rate: positive_rate("refill_rate", refill_rate)?,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn refill(&self, state: &mut BucketState, now: Timestamp) {
        let elapsed = now.saturating_since(state.last_refill_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity as f64);
        if now > state.last_refill_at {
            state.last_refill_at = now;
        }
    }

    fn full_at(&self, state: &BucketState, now: Timestamp) -> Timestamp {
        now + secs((self.capacity as f64 - state.tokens) / self.refill_rate)
    }
}

impl Algorithm for TokenBucket {
    type State = BucketState;

    fn name(&self) -> &'static str {
        "token_bucket"
    }

    fn limit(&self) -> u64 {
        self.capacity
    }

    fn initial_state(&self, now: Timestamp) -> BucketState {
        BucketState {
            tokens: self.capacity as f64,
            last_refill_at: now,
        }
    }

    fn decide(&self, state: &mut BucketState, now: Timestamp) -> Verdict {
        self.refill(state, now);

        if state.tokens + EPSILON >= 1.0 {
            state.tokens = (state.tokens - 1.0).max(0.0);
            let remaining = (state.tokens + EPSILON).floor() as u64;
            return Verdict::allow(self.capacity, remaining, Some(self.full_at(state, now)));
        }

        let retry_after = secs((1.0 - state.tokens) / self.refill_rate);
        Verdict::deny(
            self.capacity,
            Some(self.full_at(state, now)),
            Some(retry_after),
        )
    }

    fn is_idle(&self, state: &BucketState, now: Timestamp) -> bool {
        let mut projected = state.clone();
        self.refill(&mut projected, now);
        projected.tokens + EPSILON >= self.capacity as f64
    }
}
