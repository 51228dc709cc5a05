//! Ratewarden - Per-identifier admission control
//!
//! This crate decides, for each unit of work tagged with an identifier,
//! whether it may proceed now. Five time-based algorithms (token bucket,
//! leaky bucket, fixed window, sliding window log and sliding window
//! counter) and a concurrent requests limiter share one verdict shape, so
//! callers can swap strategies without changing how they answer requests.
//! State lives in a pluggable store: in-process, or a shared key/value
//! backend so several instances enforce one limit.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use clock::{Clock, ManualClock, MonotonicClock, Timestamp};
pub use error::{Result, WardenError};
pub use ratelimit::{Admission, FailurePolicy, Limiter, Verdict, Warden};
