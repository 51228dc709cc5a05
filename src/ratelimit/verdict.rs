//! The decision shape shared by every strategy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

/// Header carrying the configured limit.
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
/// Header carrying the remaining quota.
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
/// Header carrying the reset instant in epoch seconds.
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
/// Header carrying the retry delay in seconds.
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// The outcome of one admission decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Whether the unit of work may proceed
    pub allowed: bool,
    /// The configured limit (capacity, window limit or max concurrency)
    pub limit: u64,
    /// Quota left after this decision
    pub remaining: u64,
    /// When the quota is fully restored, where meaningful
    pub reset_at: Option<Timestamp>,
    /// How long to wait before retrying; only set on denial
    pub retry_after: Option<Duration>,
}

impl Verdict {
    pub fn allow(limit: u64, remaining: u64, reset_at: Option<Timestamp>) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_at,
            retry_after: None,
        }
    }

    pub fn deny(limit: u64, reset_at: Option<Timestamp>, retry_after: Option<Duration>) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at,
            retry_after,
        }
    }

    /// `reset_at` in whole epoch seconds, rounded up.
    pub fn reset_at_epoch_secs(&self) -> Option<u64> {
        self.reset_at.map(|ts| ts.epoch_secs_ceil())
    }

    /// `retry_after` in whole seconds, rounded up and never zero.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| {
            let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
            secs.max(1)
        })
    }

    /// HTTP status a collaborator should answer with.
    pub fn status_code(&self) -> u16 {
        if self.allowed {
            200
        } else {
            429
        }
    }

    /// The recommended rate limit response headers.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
        ];
        if let Some(reset) = self.reset_at_epoch_secs() {
            headers.push((HEADER_RESET, reset.to_string()));
        }
        if !self.allowed {
            if let Some(retry) = self.retry_after_secs() {
                headers.push((HEADER_RETRY_AFTER, retry.to_string()));
            }
        }
        headers
    }
}
