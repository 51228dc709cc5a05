//! Concurrent requests limiter.
//!
//! Unlike the time-based algorithms this one tracks work in flight: an
//! admission holds a lease until it is released, and nothing refills with
//! time.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};

use super::algorithm::positive_count;
use super::limiter::FailurePolicy;
use super::verdict::Verdict;
use crate::error::{Result, WardenError};
use crate::store::{CounterStore, MemoryStore};

/// Identifies one admitted unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lease(pub(crate) u64);

impl Lease {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Per-identifier set of outstanding leases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyState {
    pub leases: BTreeSet<Lease>,
}

impl ConcurrencyState {
    pub fn active_count(&self) -> u64 {
        self.leases.len() as u64
    }
}

/// Concurrent requests configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrentRequests {
    max_concurrent: u64,
}

impl ConcurrentRequests {
    pub fn new(max_concurrent: u64) -> Result<Self> {
        Ok(Self {
            max_concurrent: positive_count("max_concurrent", max_concurrent)?,
        })
    }

    pub fn max_concurrent(&self) -> u64 {
        self.max_concurrent
    }

    /// Record `lease` if a slot is free. A denial leaves `state` untouched.
    pub fn acquire(&self, state: &mut ConcurrencyState, lease: Lease) -> Verdict {
        let active = state.active_count();
        if active >= self.max_concurrent || !state.leases.insert(lease) {
            return Verdict::deny(self.max_concurrent, None, None);
        }
        Verdict::allow(self.max_concurrent, self.max_concurrent - active - 1, None)
    }

    /// Remove `lease`, returning whether it was outstanding.
    pub fn release(&self, state: &mut ConcurrencyState, lease: Lease) -> bool {
        state.leases.remove(&lease)
    }

    pub fn is_idle(&self, state: &ConcurrencyState) -> bool {
        state.leases.is_empty()
    }
}

/// Attempts made by a dropped permit before its slot is given up on.
const RELEASE_ATTEMPTS: u32 = 12;
const RELEASE_BACKOFF: Duration = Duration::from_millis(10);
const MAX_RELEASE_BACKOFF: Duration = Duration::from_secs(1);

/// Releases leases on behalf of a [`Permit`].
#[async_trait]
trait LeaseReleaser: Send + Sync {
    async fn release_lease(&self, identifier: &str, lease: Lease) -> Result<()>;
}

/// Release `lease`, backing off while the store is unreachable or contended.
async fn release_with_retry(releaser: &dyn LeaseReleaser, identifier: &str, lease: Lease) {
    let mut backoff = RELEASE_BACKOFF;
    for attempt in 1..=RELEASE_ATTEMPTS {
        match releaser.release_lease(identifier, lease).await {
            Ok(()) => return,
            Err(e @ (WardenError::StoreUnavailable(_) | WardenError::Contention { .. }))
                if attempt < RELEASE_ATTEMPTS =>
            {
                debug!(
                    identifier = %identifier,
                    lease = %lease,
                    attempt,
                    error = %e,
                    "Release failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_RELEASE_BACKOFF);
            }
            Err(e) => {
                warn!(
                    identifier = %identifier,
                    lease = %lease,
                    error = %e,
                    "Failed to release dropped permit"
                );
                return;
            }
        }
    }
}

/// A held concurrency slot.
///
/// Release it with [`release`](Permit::release). A permit dropped without
/// being released, including one whose `release` failed or was cancelled,
/// frees its slot from a task spawned on the current Tokio runtime. That task
/// keeps retrying while the store is unreachable.
pub struct Permit {
    identifier: String,
    lease: Lease,
    released: bool,
    releaser: Arc<dyn LeaseReleaser>,
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("identifier", &self.identifier)
            .field("lease", &self.lease)
            .field("released", &self.released)
            .finish()
    }
}

impl Permit {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn lease(&self) -> Lease {
        self.lease
    }

    /// Give the slot back.
    ///
    /// If the store cannot be reached the error is returned and the permit
    /// falls back to releasing in the background once dropped.
    pub async fn release(mut self) -> Result<()> {
        let result = self.releaser.release_lease(&self.identifier, self.lease).await;
        match result {
            Ok(()) => {
                self.released = true;
                Ok(())
            }
            Err(e @ WardenError::ReleaseWithoutAcquire { .. }) => {
                // Retrying cannot succeed
                self.released = true;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Detach the permit without releasing its slot. The lease must then be
    /// released through [`ConcurrencyLimiter::release`].
    pub fn forget(mut self) -> Lease {
        self.released = true;
        self.lease
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let identifier = std::mem::take(&mut self.identifier);
        let lease = self.lease;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let releaser = Arc::clone(&self.releaser);
                handle.spawn(async move {
                    release_with_retry(releaser.as_ref(), &identifier, lease).await;
                });
            }
            Err(_) => {
                warn!(
                    identifier = %identifier,
                    lease = %lease,
                    "Permit dropped outside a Tokio runtime, slot not released"
                );
            }
        }
    }
}

/// The answer to an admission request.
///
/// `permit` is present only when a concurrency slot was taken.
#[derive(Debug)]
pub struct Admission {
    pub verdict: Verdict,
    pub permit: Option<Permit>,
}

impl Admission {
    pub(crate) fn from_verdict(verdict: Verdict) -> Self {
        Self {
            verdict,
            permit: None,
        }
    }

    pub fn allowed(&self) -> bool {
        self.verdict.allowed
    }
}

struct ConcurrencyInner<S> {
    strategy: ConcurrentRequests,
    store: S,
    failure_policy: FailurePolicy,
}

#[async_trait]
impl<S> LeaseReleaser for ConcurrencyInner<S>
where
    S: CounterStore<ConcurrencyState>,
{
    async fn release_lease(&self, identifier: &str, lease: Lease) -> Result<()> {
        let strategy = self.strategy;
        let released = self
            .store
            .update(identifier, |state| {
                let mut state = state.unwrap_or_default();
                let released = strategy.release(&mut state, lease);
                (state, released)
            })
            .await?;

        if !released {
            return Err(WardenError::ReleaseWithoutAcquire {
                identifier: identifier.to_string(),
                lease: lease.id(),
            });
        }
        trace!(identifier = %identifier, lease = %lease, "Lease released");
        Ok(())
    }
}

/// Concurrency limits for many identifiers over one store.
///
/// Cloning is cheap and clones share state.
pub struct ConcurrencyLimiter<S = MemoryStore<ConcurrencyState>> {
    inner: Arc<ConcurrencyInner<S>>,
}

impl<S> Clone for ConcurrencyLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ConcurrencyLimiter {
    pub fn new(strategy: ConcurrentRequests) -> Self {
        Self::with_store(strategy, MemoryStore::new())
    }
}

impl<S> ConcurrencyLimiter<S>
where
    S: CounterStore<ConcurrencyState> + 'static,
{
    pub fn with_store(strategy: ConcurrentRequests, store: S) -> Self {
        Self::build(strategy, store, FailurePolicy::default())
    }

    fn build(strategy: ConcurrentRequests, store: S, failure_policy: FailurePolicy) -> Self {
        Self {
            inner: Arc::new(ConcurrencyInner {
                strategy,
                store,
                failure_policy,
            }),
        }
    }

    /// Replace the failure policy. Only affects limiters not yet cloned.
    pub fn with_failure_policy(self, failure_policy: FailurePolicy) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => Self::build(inner.strategy, inner.store, failure_policy),
            Err(inner) => {
                warn!("Failure policy not applied to a shared concurrency limiter");
                Self { inner }
            }
        }
    }

    pub fn strategy(&self) -> &ConcurrentRequests {
        &self.inner.strategy
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.inner.failure_policy
    }

    /// Take a slot for `identifier` if one is free. Never waits.
    #[instrument(skip(self))]
    pub async fn acquire(&self, identifier: &str) -> Result<Admission> {
        let strategy = self.inner.strategy;
        let lease = Lease(rand::random());

        let verdict = match self
            .inner
            .store
            .update(identifier, |state| {
                let mut state = state.unwrap_or_default();
                let verdict = strategy.acquire(&mut state, lease);
                (state, verdict)
            })
            .await
        {
            Ok(verdict) => verdict,
            Err(WardenError::StoreUnavailable(reason)) => {
                let verdict = self.inner.failure_policy.verdict(
                    strategy.max_concurrent(),
                    identifier,
                    &reason,
                );
                return Ok(Admission::from_verdict(verdict));
            }
            Err(e) => return Err(e),
        };

        if !verdict.allowed {
            debug!(
                identifier = %identifier,
                max_concurrent = strategy.max_concurrent(),
                "Concurrency limit reached"
            );
            return Ok(Admission::from_verdict(verdict));
        }

        trace!(identifier = %identifier, lease = %lease, "Lease acquired");
        let releaser: Arc<dyn LeaseReleaser> = self.inner.clone();
        Ok(Admission {
            verdict,
            permit: Some(Permit {
                identifier: identifier.to_string(),
                lease,
                released: false,
                releaser,
            }),
        })
    }

    /// Release a lease detached with [`Permit::forget`].
    pub async fn release(&self, identifier: &str, lease: Lease) -> Result<()> {
        self.inner.release_lease(identifier, lease).await
    }

    /// Number of outstanding leases for `identifier`.
    pub async fn active(&self, identifier: &str) -> Result<u64> {
        Ok(self
            .inner
            .store
            .get(identifier)
            .await?
            .map_or(0, |state| state.active_count()))
    }

    pub async fn tracked(&self) -> Result<usize> {
        self.inner.store.len().await
    }

    /// Drop identifiers with no outstanding leases.
    pub async fn evict_idle(&self) -> Result<usize> {
        let strategy = self.inner.strategy;
        let evicted = self
            .inner
            .store
            .evict(|state| strategy.is_idle(state))
            .await?;
        if evicted > 0 {
            debug!(algorithm = "concurrent", evicted, "Evicted idle identifiers");
        }
        Ok(evicted)
    }
}
