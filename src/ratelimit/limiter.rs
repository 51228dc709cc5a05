//! Limiter facade binding an algorithm to a store and a clock.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, instrument, trace, warn};

use super::algorithm::Algorithm;
use super::verdict::Verdict;
use crate::clock::{Clock, MonotonicClock, Timestamp};
use crate::error::{Result, WardenError};
use crate::store::{CounterStore, MemoryStore};

/// What to answer when the store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Deny the request.
    #[default]
    FailClosed,
    /// Let the request through unlimited.
    FailOpen,
}

impl FailurePolicy {
    /// The verdict to return in place of a decision the store could not make.
    pub(crate) fn verdict(&self, limit: u64, identifier: &str, reason: &str) -> Verdict {
        match self {
            FailurePolicy::FailOpen => {
                warn!(
                    identifier = %identifier,
                    reason = %reason,
                    "Store unavailable, failing open"
                );
                Verdict::allow(limit, 0, None)
            }
            FailurePolicy::FailClosed => {
                warn!(
                    identifier = %identifier,
                    reason = %reason,
                    "Store unavailable, failing closed"
                );
                Verdict::deny(limit, None, None)
            }
        }
    }
}

/// Admission decisions for one algorithm over one store.
///
/// This struct is thread-safe and can be shared across tasks behind an
/// `Arc`.
pub struct Limiter<A: Algorithm, S = MemoryStore<<A as Algorithm>::State>> {
    algorithm: A,
    store: S,
    clock: Arc<dyn Clock>,
    failure_policy: FailurePolicy,
}

impl<A: Algorithm> Limiter<A> {
    /// Create an in-process limiter on the monotonic clock.
    pub fn new(algorithm: A) -> Self {
        Self::with_store(algorithm, MemoryStore::new())
    }
}

impl<A, S> Limiter<A, S>
where
    A: Algorithm,
    S: CounterStore<A::State>,
{
    pub fn with_store(algorithm: A, store: S) -> Self {
        Self {
            algorithm,
            store,
            clock: Arc::new(MonotonicClock::new()),
            failure_policy: FailurePolicy::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn algorithm(&self) -> &A {
        &self.algorithm
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    async fn now(&self) -> Result<Timestamp> {
        Ok(match self.store.now().await? {
            Some(now) => now,
            None => self.clock.now(),
        })
    }

    /// Decide whether one unit of work for `identifier` may proceed.
    ///
    /// An unreachable store is answered according to the configured
    /// [`FailurePolicy`]; other store errors are returned.
    #[instrument(skip(self), fields(algorithm = self.algorithm.name()))]
    pub async fn decide(&self, identifier: &str) -> Result<Verdict> {
        match self.try_decide(identifier).await {
            Err(WardenError::StoreUnavailable(reason)) => Ok(self.failure_policy.verdict(
                self.algorithm.limit(),
                identifier,
                &reason,
            )),
            result => result,
        }
    }

    async fn try_decide(&self, identifier: &str) -> Result<Verdict> {
        let now = self.now().await?;
        let algorithm = &self.algorithm;

        let verdict = self
            .store
            .update(identifier, |state| {
                let mut state = state.unwrap_or_else(|| algorithm.initial_state(now));
                let verdict = algorithm.decide(&mut state, now);
                (state, verdict)
            })
            .await?;

        if verdict.allowed {
            trace!(
                identifier = %identifier,
                remaining = verdict.remaining,
                "Request admitted"
            );
        } else {
            debug!(
                identifier = %identifier,
                limit = verdict.limit,
                retry_after = ?verdict.retry_after,
                "Rate limit exceeded"
            );
        }
        Ok(verdict)
    }

    /// Forget all state for `identifier`.
    pub async fn reset(&self, identifier: &str) -> Result<bool> {
        self.store.remove(identifier).await
    }

    /// Number of identifiers with stored state.
    pub async fn tracked(&self) -> Result<usize> {
        self.store.len().await
    }

    /// Drop state that no longer influences decisions.
    pub async fn evict_idle(&self) -> Result<usize> {
        let now = self.now().await?;
        let algorithm = &self.algorithm;
        let evicted = self
            .store
            .evict(|state| algorithm.is_idle(state, now))
            .await?;
        if evicted > 0 {
            debug!(algorithm = algorithm.name(), evicted, "Evicted idle identifiers");
        }
        Ok(evicted)
    }
}

impl<A, S> Limiter<A, S>
where
    A: Algorithm,
    S: CounterStore<A::State> + 'static,
{
    /// Run [`evict_idle`](Self::evict_idle) every `every` on the current
    /// Tokio runtime until the returned handle is aborted.
    pub fn spawn_sweeper(limiter: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = limiter.evict_idle().await {
                    warn!(error = %e, "Idle eviction failed");
                }
            }
        })
    }
}
