//! Strategy trait shared by the time-based limiting algorithms.

use std::fmt::Debug;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::verdict::Verdict;
use crate::clock::Timestamp;
use crate::error::{Result, WardenError};

/// Tolerance for float comparisons on token and level arithmetic.
pub(crate) const EPSILON: f64 = 1e-9;

/// A rate limiting algorithm.
///
/// Implementations hold only configuration. All per-identifier state is owned
/// by a [`CounterStore`](crate::store::CounterStore) and handed to
/// [`decide`](Algorithm::decide) for the duration of one atomic update, so
/// `decide` must be a pure function of the state and `now`: stores that use
/// optimistic concurrency may run it more than once.
pub trait Algorithm: Send + Sync + 'static {
    /// Per-identifier state.
    type State: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Algorithm name (for logging).
    fn name(&self) -> &'static str;

    /// The configured limit reported in verdicts.
    fn limit(&self) -> u64;

    /// State for an identifier seen for the first time.
    fn initial_state(&self, now: Timestamp) -> Self::State;

    /// Admit or deny one unit of work, updating `state` in place.
    fn decide(&self, state: &mut Self::State, now: Timestamp) -> Verdict;

    /// Whether `state` is indistinguishable from a fresh one at `now` and can
    /// be evicted without changing future decisions.
    fn is_idle(&self, state: &Self::State, now: Timestamp) -> bool;
}

pub(crate) fn positive_count(what: &str, value: u64) -> Result<u64> {
    if value == 0 {
        return Err(WardenError::Config(format!("{what} must be greater than 0")));
    }
    Ok(value)
}

pub(crate) fn positive_rate(what: &str, value: f64) -> Result<f64> {
    if !value.is_finite() || value <= 0.0 {
        return Err(WardenError::Config(format!(
            "{what} must be a finite number greater than 0, got {value}"
        )));
    }
    Ok(value)
}

pub(crate) fn positive_window(value: Duration) -> Result<Duration> {
    if value.is_zero() {
        return Err(WardenError::Config("window must be greater than 0".to_string()));
    }
    Ok(value)
}

/// Seconds to a duration, clamping negative values to zero.
pub(crate) fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_helpers() {
        assert!(positive_count("limit", 0).is_err());
        assert_eq!(positive_count("limit", 3).unwrap(), 3);

        assert!(positive_rate("rate", 0.0).is_err());
        assert!(positive_rate("rate", -1.0).is_err());
        assert!(positive_rate("rate", f64::INFINITY).is_err());
        assert!(positive_rate("rate", f64::NAN).is_err());
        assert_eq!(positive_rate("rate", 0.5).unwrap(), 0.5);

        assert!(positive_window(Duration::ZERO).is_err());
    }

    #[test]
    fn test_secs_clamps_negative() {
        assert_eq!(secs(-1.0), Duration::ZERO);
        assert_eq!(secs(1.5), Duration::from_millis(1500));
    }
}
