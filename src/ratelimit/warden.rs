//! Rule-driven registry of limiters.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::concurrency::{Admission, ConcurrencyLimiter, ConcurrencyState, ConcurrentRequests};
use super::fixed_window::{FixedWindow, WindowState};
use super::leaky_bucket::{LeakState, LeakyBucket};
use super::limiter::{FailurePolicy, Limiter};
use super::rules::{PolicyConfig, RateLimitRules};
use super::sliding_counter::{CounterPairState, SlidingWindowCounter};
use super::sliding_log::{LogState, SlidingWindowLog};
use super::token_bucket::{BucketState, TokenBucket};
use crate::clock::Clock;
use crate::error::{Result, WardenError};
use crate::store::{InProcessStores, KvBackend, RemoteStoreConfig, SharedStores, StoreBuilder};

/// A limiter for any supported policy, keeping its state in stores made by
/// `F`.
pub enum AnyLimiter<F: StoreBuilder = InProcessStores> {
    TokenBucket(Limiter<TokenBucket, F::Store<BucketState>>),
    LeakyBucket(Limiter<LeakyBucket, F::Store<LeakState>>),
    FixedWindow(Limiter<FixedWindow, F::Store<WindowState>>),
    SlidingLog(Limiter<SlidingWindowLog, F::Store<LogState>>),
    SlidingWindow(Limiter<SlidingWindowCounter, F::Store<CounterPairState>>),
    Concurrent(ConcurrencyLimiter<F::Store<ConcurrencyState>>),
}

/// Reject a store TTL that would expire state while it still matters.
fn check_entry_ttl(policy: &PolicyConfig, ttl: Option<Duration>) -> Result<()> {
    let Some(ttl) = ttl else {
        return Ok(());
    };
    match policy.state_horizon()? {
        Some(horizon) if ttl < horizon => Err(WardenError::Config(format!(
            "entry TTL of {}s is shorter than the {:.3}s a {} policy keeps state",
            ttl.as_secs(),
            horizon.as_secs_f64(),
            policy.algorithm_name()
        ))),
        Some(_) => Ok(()),
        None => {
            warn!(
                ttl_secs = ttl.as_secs(),
                "Leases held longer than the entry TTL will be dropped"
            );
            Ok(())
        }
    }
}

impl<F: StoreBuilder> AnyLimiter<F> {
    /// Build the limiter enforcing `policy` for rule `rule`.
    pub fn build(
        rule: &str,
        policy: &PolicyConfig,
        stores: &F,
        clock: Arc<dyn Clock>,
        failure_policy: FailurePolicy,
    ) -> Result<Self> {
        let limiter = match policy {
            PolicyConfig::TokenBucket {
                capacity,
                refill_rate,
            } => AnyLimiter::TokenBucket(
                Limiter::with_store(
                    TokenBucket::new(*capacity, *refill_rate)?,
                    stores.build::<BucketState>(rule)?,
                )
                .with_clock(clock)
                .with_failure_policy(failure_policy),
            ),
            PolicyConfig::LeakyBucket {
                capacity,
                leak_rate,
            } => AnyLimiter::LeakyBucket(
                Limiter::with_store(
                    LeakyBucket::new(*capacity, *leak_rate)?,
                    stores.build::<LeakState>(rule)?,
                )
                .with_clock(clock)
                .with_failure_policy(failure_policy),
            ),
            PolicyConfig::FixedWindow {
                limit,
                window,
                alignment,
            } => AnyLimiter::FixedWindow(
                Limiter::with_store(
                    FixedWindow::new(*limit, window.duration()?)?.with_alignment(*alignment),
                    stores.build::<WindowState>(rule)?,
                )
                .with_clock(clock)
                .with_failure_policy(failure_policy),
            ),
            PolicyConfig::SlidingLog { limit, window } => AnyLimiter::SlidingLog(
                Limiter::with_store(
                    SlidingWindowLog::new(*limit, window.duration()?)?,
                    stores.build::<LogState>(rule)?,
                )
                .with_clock(clock)
                .with_failure_policy(failure_policy),
            ),
            PolicyConfig::SlidingWindow { limit, window } => AnyLimiter::SlidingWindow(
                Limiter::with_store(
                    SlidingWindowCounter::new(*limit, window.duration()?)?,
                    stores.build::<CounterPairState>(rule)?,
                )
                .with_clock(clock)
                .with_failure_policy(failure_policy),
            ),
            PolicyConfig::Concurrent { max_concurrent } => AnyLimiter::Concurrent(
                ConcurrencyLimiter::with_store(
                    ConcurrentRequests::new(*max_concurrent)?,
                    stores.build::<ConcurrencyState>(rule)?,
                )
                .with_failure_policy(failure_policy),
            ),
        };
        check_entry_ttl(policy, stores.entry_ttl())?;
        Ok(limiter)
    }

    pub fn algorithm_name(&self) -> &'static str {
        match self {
            AnyLimiter::TokenBucket(_) => "token_bucket",
            AnyLimiter::LeakyBucket(_) => "leaky_bucket",
            AnyLimiter::FixedWindow(_) => "fixed_window",
            AnyLimiter::SlidingLog(_) => "sliding_log",
            AnyLimiter::SlidingWindow(_) => "sliding_window",
            AnyLimiter::Concurrent(_) => "concurrent",
        }
    }

    /// Admit one unit of work. Only the concurrent strategy hands out a
    /// permit.
    pub async fn admit(&self, identifier: &str) -> Result<Admission> {
        let verdict = match self {
            AnyLimiter::TokenBucket(limiter) => limiter.decide(identifier).await?,
            AnyLimiter::LeakyBucket(limiter) => limiter.decide(identifier).await?,
            AnyLimiter::FixedWindow(limiter) => limiter.decide(identifier).await?,
            AnyLimiter::SlidingLog(limiter) => limiter.decide(identifier).await?,
            AnyLimiter::SlidingWindow(limiter) => limiter.decide(identifier).await?,
            AnyLimiter::Concurrent(limiter) => return limiter.acquire(identifier).await,
        };
        Ok(Admission::from_verdict(verdict))
    }

    pub async fn evict_idle(&self) -> Result<usize> {
        match self {
            AnyLimiter::TokenBucket(limiter) => limiter.evict_idle().await,
            AnyLimiter::LeakyBucket(limiter) => limiter.evict_idle().await,
            AnyLimiter::FixedWindow(limiter) => limiter.evict_idle().await,
            AnyLimiter::SlidingLog(limiter) => limiter.evict_idle().await,
            AnyLimiter::SlidingWindow(limiter) => limiter.evict_idle().await,
            AnyLimiter::Concurrent(limiter) => limiter.evict_idle().await,
        }
    }

    pub async fn tracked(&self) -> Result<usize> {
        match self {
            AnyLimiter::TokenBucket(limiter) => limiter.tracked().await,
            AnyLimiter::LeakyBucket(limiter) => limiter.tracked().await,
            AnyLimiter::FixedWindow(limiter) => limiter.tracked().await,
            AnyLimiter::SlidingLog(limiter) => limiter.tracked().await,
            AnyLimiter::SlidingWindow(limiter) => limiter.tracked().await,
            AnyLimiter::Concurrent(limiter) => limiter.tracked().await,
        }
    }
}

struct NamedLimiter<F: StoreBuilder> {
    name: String,
    prefix: Option<String>,
    limiter: AnyLimiter<F>,
}

/// One limiter per configured rule, selected by identifier prefix.
pub struct Warden<F: StoreBuilder = InProcessStores> {
    rules: RateLimitRules,
    limiters: Vec<NamedLimiter<F>>,
}

impl Warden {
    /// Build an in-process limiter for every rule.
    pub fn from_rules(
        rules: RateLimitRules,
        clock: Arc<dyn Clock>,
        failure_policy: FailurePolicy,
    ) -> Result<Self> {
        Self::with_stores(rules, InProcessStores, clock, failure_policy)
    }
}

impl<B: KvBackend + 'static> Warden<SharedStores<B>> {
    /// Build a limiter for every rule over a shared backend, so every
    /// instance built on the same backend enforces the same limits.
    pub fn shared(
        rules: RateLimitRules,
        backend: Arc<B>,
        config: RemoteStoreConfig,
        clock: Arc<dyn Clock>,
        failure_policy: FailurePolicy,
    ) -> Result<Self> {
        Self::with_stores(rules, SharedStores::new(backend, config), clock, failure_policy)
    }
}

impl<F: StoreBuilder> Warden<F> {
    /// Build a limiter for every rule, each over its own store from `stores`.
    pub fn with_stores(
        rules: RateLimitRules,
        stores: F,
        clock: Arc<dyn Clock>,
        failure_policy: FailurePolicy,
    ) -> Result<Self> {
        rules.validate()?;
        let mut limiters = Vec::with_capacity(rules.rules.len());
        for rule in &rules.rules {
            let limiter = AnyLimiter::build(
                &rule.name,
                &rule.policy,
                &stores,
                Arc::clone(&clock),
                failure_policy,
            )
            .map_err(|e| WardenError::Config(format!("rule '{}': {}", rule.name, e)))?;
            debug!(
                rule = %rule.name,
                prefix = ?rule.prefix,
                algorithm = limiter.algorithm_name(),
                "Limiter built"
            );
            limiters.push(NamedLimiter {
                name: rule.name.clone(),
                prefix: rule.prefix.clone(),
                limiter,
            });
        }
        info!(rules = limiters.len(), "Warden initialized");
        Ok(Self { rules, limiters })
    }

    pub fn rules(&self) -> &RateLimitRules {
        &self.rules
    }

    /// The limiter responsible for `identifier` and its rule name.
    pub fn limiter_for(&self, identifier: &str) -> Option<(&str, &AnyLimiter<F>)> {
        let rule = self.rules.find_rule(identifier)?;
        self.limiters
            .iter()
            .find(|named| named.name == rule.name && named.prefix == rule.prefix)
            .map(|named| (named.name.as_str(), &named.limiter))
    }

    /// Admit one unit of work for `identifier` under its matching rule.
    pub async fn admit(&self, identifier: &str) -> Result<Admission> {
        let (rule, limiter) = self
            .limiter_for(identifier)
            .ok_or_else(|| WardenError::NoMatchingRule(identifier.to_string()))?;
        let admission = limiter.admit(identifier).await?;
        if !admission.allowed() {
            debug!(identifier = %identifier, rule = %rule, "Request denied");
        }
        Ok(admission)
    }

    /// Evict idle state from every limiter.
    pub async fn evict_idle(&self) -> Result<usize> {
        let mut evicted = 0;
        for named in &self.limiters {
            evicted += named.limiter.evict_idle().await?;
        }
        Ok(evicted)
    }

    /// Identifiers with state across all limiters.
    pub async fn tracked(&self) -> Result<usize> {
        let mut tracked = 0;
        for named in &self.limiters {
            tracked += named.limiter.tracked().await?;
        }
        Ok(tracked)
    }

    /// Run [`evict_idle`](Self::evict_idle) every `every` until the handle is
    /// aborted.
    pub fn spawn_sweeper(warden: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match warden.evict_idle().await {
                    Ok(0) => {}
                    Ok(evicted) => debug!(evicted, "Sweep complete"),
                    Err(e) => warn!(error = %e, "Idle eviction failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryKv;

    const RULES: &str = r#"
rules:
  - name: login
    prefix: "login:"
    policy:
      algorithm: fixed_window
      limit: 2
      window: minute
  - name: api
    prefix: "api:"
    policy:
      algorithm: sliding_window
      limit: 3
      window: 10
  - name: uploads
    prefix: "upload:"
    policy:
      algorithm: concurrent
      max_concurrent: 1
  - name: webhooks
    prefix: "hook:"
    policy:
      algorithm: leaky_bucket
      capacity: 1
      leak_rate: 1
"#;

    fn warden(clock: &ManualClock) -> Warden {
        let rules = RateLimitRules::from_yaml(RULES).unwrap();
        Warden::from_rules(rules, Arc::new(clock.clone()), FailurePolicy::default()).unwrap()
    }

    #[tokio::test]
    async fn test_routes_by_prefix() {
        let clock = ManualClock::at_secs(0.0);
        let warden = warden(&clock);

        assert!(warden.admit("login:alice").await.unwrap().allowed());
        assert!(warden.admit("login:alice").await.unwrap().allowed());
        let denied = warden.admit("login:alice").await.unwrap();
        assert!(!denied.allowed());
        assert_eq!(denied.verdict.limit, 2);

        // Separate rule, separate budget
        assert!(warden.admit("api:alice").await.unwrap().allowed());
        assert_eq!(warden.limiter_for("hook:x").unwrap().1.algorithm_name(), "leaky_bucket");
    }

    #[tokio::test]
    async fn test_unmatched_identifier() {
        let clock = ManualClock::at_secs(0.0);
        let warden = warden(&clock);

        let err = warden.admit("other:alice").await.unwrap_err();
        assert!(matches!(err, WardenError::NoMatchingRule(id) if id == "other:alice"));
    }

    #[tokio::test]
    async fn test_concurrent_rule_returns_permit() {
        let clock = ManualClock::at_secs(0.0);
        let warden = warden(&clock);

        let admission = warden.admit("upload:bob").await.unwrap();
        let permit = admission.permit.expect("concurrency slot");
        assert!(!warden.admit("upload:bob").await.unwrap().allowed());

        permit.release().await.unwrap();
        assert!(warden.admit("upload:bob").await.unwrap().permit.is_some());
    }

    #[tokio::test]
    async fn test_time_based_rules_have_no_permit() {
        let clock = ManualClock::at_secs(0.0);
        let warden = warden(&clock);
        let admission = warden.admit("api:carol").await.unwrap();
        assert!(admission.allowed());
        assert!(admission.permit.is_none());
    }

    #[tokio::test]
    async fn test_evict_idle_across_rules() {
        let clock = ManualClock::at_secs(0.0);
        let warden = warden(&clock);
        warden.admit("login:a").await.unwrap();
        warden.admit("api:b").await.unwrap();
        warden.admit("hook:c").await.unwrap();
        assert_eq!(warden.tracked().await.unwrap(), 3);

        clock.advance(Duration::from_secs(3600));
        assert_eq!(warden.evict_idle().await.unwrap(), 3);
        assert_eq!(warden.tracked().await.unwrap(), 0);
    }

    #[test]
    fn test_invalid_policy_names_rule() {
        let yaml = r#"
rules:
  - name: broken
    policy:
      algorithm: token_bucket
      capacity: 0
      refill_rate: 1
"#;
        let rules = RateLimitRules::from_yaml(yaml).unwrap();
        let clock = ManualClock::at_secs(0.0);
        let result = Warden::from_rules(rules, Arc::new(clock), FailurePolicy::default());
        match result {
            Err(WardenError::Config(message)) => assert!(message.contains("broken")),
            _ => panic!("expected configuration error"),
        }
    }

    fn shared_warden(
        clock: &ManualClock,
        backend: &Arc<MemoryKv>,
    ) -> Warden<SharedStores<MemoryKv>> {
        let rules = RateLimitRules::from_yaml(RULES).unwrap();
        Warden::shared(
            rules,
            Arc::clone(backend),
            RemoteStoreConfig::default(),
            Arc::new(clock.clone()),
            FailurePolicy::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_sweeper_evicts_idle_state() {
        let clock = ManualClock::at_secs(0.0);
        let warden = Arc::new(warden(&clock));
        warden.admit("login:a").await.unwrap();
        warden.admit("hook:b").await.unwrap();
        assert_eq!(warden.tracked().await.unwrap(), 2);

        clock.advance(Duration::from_secs(3600));
        let sweeper = Warden::spawn_sweeper(Arc::clone(&warden), Duration::from_millis(10));
        for _ in 0..100 {
            if warden.tracked().await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sweeper.abort();
        assert_eq!(warden.tracked().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shared_wardens_enforce_one_limit() {
        let clock = ManualClock::at_secs(0.0);
        let backend = Arc::new(MemoryKv::with_clock(Arc::new(clock.clone())));
        let first = shared_warden(&clock, &backend);
        let second = shared_warden(&clock, &backend);

        assert!(first.admit("login:alice").await.unwrap().allowed());
        assert!(second.admit("login:alice").await.unwrap().allowed());
        assert!(!first.admit("login:alice").await.unwrap().allowed());
        assert!(!second.admit("login:alice").await.unwrap().allowed());

        // Leases are visible to every instance
        let permit = first.admit("upload:bob").await.unwrap().permit.unwrap();
        assert!(!second.admit("upload:bob").await.unwrap().allowed());
        permit.release().await.unwrap();
        assert!(second.admit("upload:bob").await.unwrap().allowed());

        // Rules keep separate keys for the same identifier
        assert!(backend.get("ratewarden:login:alice").await.unwrap().is_some());
        assert!(backend.get("ratewarden:api:alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shared_warden_fails_closed_during_outage() {
        let clock = ManualClock::at_secs(0.0);
        let backend = Arc::new(MemoryKv::with_clock(Arc::new(clock.clone())));
        let warden = shared_warden(&clock, &backend);

        backend.set_available(false);
        let admission = warden.admit("api:alice").await.unwrap();
        assert!(!admission.allowed());
    }

    #[test]
    fn test_entry_ttl_shorter_than_state_rejected() {
        let clock = ManualClock::at_secs(0.0);
        // The login rule counts over a full minute
        let config = RemoteStoreConfig {
            entry_ttl_secs: Some(15),
            ..Default::default()
        };
        let rules = RateLimitRules::from_yaml(RULES).unwrap();
        let result = Warden::shared(
            rules,
            Arc::new(MemoryKv::new()),
            config,
            Arc::new(clock.clone()),
            FailurePolicy::default(),
        );
        match result {
            Err(WardenError::Config(message)) => assert!(message.contains("login")),
            _ => panic!("expected configuration error"),
        }

        let config = RemoteStoreConfig {
            entry_ttl_secs: Some(120),
            ..Default::default()
        };
        let rules = RateLimitRules::from_yaml(RULES).unwrap();
        assert!(Warden::shared(
            rules,
            Arc::new(MemoryKv::new()),
            config,
            Arc::new(clock),
            FailurePolicy::default(),
        )
        .is_ok());
    }
}
