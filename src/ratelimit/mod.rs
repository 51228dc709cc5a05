//! Rate limiting algorithms, limiters and rule matching.

mod algorithm;
mod concurrency;
mod fixed_window;
mod leaky_bucket;
mod limiter;
mod rules;
mod sliding_counter;
mod sliding_log;
mod token_bucket;
mod verdict;
mod warden;

pub use algorithm::Algorithm;
pub use concurrency::{
    Admission, ConcurrencyLimiter, ConcurrencyState, ConcurrentRequests, Lease, Permit,
};
pub use fixed_window::{FixedWindow, WindowAlignment, WindowState};
pub use leaky_bucket::{LeakState, LeakyBucket};
pub use limiter::{FailurePolicy, Limiter};
pub use rules::{PolicyConfig, RateLimitRules, Rule, TimeUnit, WindowSpec};
pub use sliding_counter::{CounterPairState, SlidingWindowCounter};
pub use sliding_log::{LogState, SlidingWindowLog};
pub use token_bucket::{BucketState, TokenBucket};
pub use verdict::{
    Verdict, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER,
};
pub use warden::{AnyLimiter, Warden};
