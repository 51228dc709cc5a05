//! Counter store backed by a shared key/value backend.
//!
//! State is JSON-encoded under `{namespace}:{identifier}` and updated with
//! an optimistic read, apply, compare-and-swap loop. Because the update
//! closure is pure, losing a race just means running it again against the
//! fresh state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::kv::KvBackend;
use super::CounterStore;
use crate::clock::Timestamp;
use crate::error::{Result, WardenError};

/// Configuration for a [`RemoteStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStoreConfig {
    /// Key prefix separating this limiter's state from other users of the
    /// backend
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Compare-and-swap attempts before giving up with a contention error
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay between attempts, in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Expire keys that have not been written for this many seconds.
    ///
    /// Must outlast the time a policy's state stays relevant (a full refill,
    /// a drain, or the window length) or expired state over-admits. Leases of
    /// concurrent policies held longer than this are lost.
    #[serde(default)]
    pub entry_ttl_secs: Option<u64>,

    /// Evaluate decisions against the backend's clock instead of the local one
    #[serde(default)]
    pub use_backend_clock: bool,
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            entry_ttl_secs: None,
            use_backend_clock: false,
        }
    }
}

fn default_namespace() -> String {
    "ratewarden".to_string()
}

fn default_max_attempts() -> u32 {
    16
}

fn default_retry_backoff_ms() -> u64 {
    2
}

/// A [`CounterStore`] that keeps state in a shared [`KvBackend`].
pub struct RemoteStore<B> {
    backend: Arc<B>,
    config: RemoteStoreConfig,
    instance_id: String,
}

impl<B> std::fmt::Debug for RemoteStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("instance_id", &self.instance_id)
            .field("config", &self.config)
            .finish()
    }
}

impl<B: KvBackend> RemoteStore<B> {
    pub fn new(backend: Arc<B>, config: RemoteStoreConfig) -> Result<Self> {
        if config.max_attempts == 0 {
            return Err(WardenError::Config(
                "max_attempts must be greater than 0".to_string(),
            ));
        }
        let instance_id = uuid::Uuid::new_v4().to_string();
        info!(
            instance_id = %instance_id,
            namespace = %config.namespace,
            "Remote counter store created"
        );
        Ok(Self {
            backend,
            config,
            instance_id,
        })
    }

    /// Identifier of this store instance, used in log fields.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    fn prefix(&self) -> String {
        format!("{}:", self.config.namespace)
    }

    fn key(&self, identifier: &str) -> String {
        format!("{}:{}", self.config.namespace, identifier)
    }

    fn ttl(&self) -> Option<Duration> {
        self.config.entry_ttl_secs.map(Duration::from_secs)
    }

    /// Linear backoff with up to one base interval of jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.config.retry_backoff_ms);
        let jitter = rand::thread_rng().gen_range(0..=self.config.retry_backoff_ms * 1_000);
        base * attempt + Duration::from_micros(jitter)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[async_trait]
impl<T, B> CounterStore<T> for RemoteStore<B>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    B: KvBackend + 'static,
{
    async fn update<R, F>(&self, identifier: &str, apply: F) -> Result<R>
    where
        F: Fn(Option<T>) -> (T, R) + Send + Sync,
        R: Send,
    {
        let key = self.key(identifier);
        let ttl = self.ttl();

        for attempt in 1..=self.config.max_attempts {
            let (expected, current) = match self.backend.get(&key).await? {
                Some(stored) => (Some(stored.version), Some(Self::decode::<T>(&stored.value)?)),
                None => (None, None),
            };

            let (next, output) = apply(current);
            let encoded = serde_json::to_vec(&next)?;

            if self
                .backend
                .compare_and_swap(&key, expected, encoded, ttl)
                .await?
            {
                return Ok(output);
            }

            debug!(
                instance_id = %self.instance_id,
                key = %key,
                attempt = attempt,
                "Compare-and-swap lost, retrying"
            );
            tokio::time::sleep(self.backoff(attempt)).await;
        }

        warn!(
            instance_id = %self.instance_id,
            key = %key,
            attempts = self.config.max_attempts,
            "Giving up on contended key"
        );
        Err(WardenError::Contention {
            key,
            attempts: self.config.max_attempts,
        })
    }

    async fn get(&self, identifier: &str) -> Result<Option<T>> {
        match self.backend.get(&self.key(identifier)).await? {
            Some(stored) => Ok(Some(Self::decode(&stored.value)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, identifier: &str) -> Result<bool> {
        self.backend.delete(&self.key(identifier)).await
    }

    async fn evict<P>(&self, is_idle: P) -> Result<usize>
    where
        P: Fn(&T) -> bool + Send + Sync,
    {
        let mut evicted = 0;
        for key in self.backend.keys(&self.prefix()).await? {
            let Some(stored) = self.backend.get(&key).await? else {
                continue;
            };
            let state: T = match Self::decode(&stored.value) {
                Ok(state) => state,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping undecodable state during eviction");
                    continue;
                }
            };
            // A concurrent write changes the version and keeps the key alive
            if is_idle(&state) && self.backend.compare_and_delete(&key, stored.version).await? {
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.backend.keys(&self.prefix()).await?.len())
    }

    async fn now(&self) -> Result<Option<Timestamp>> {
        if self.config.use_backend_clock {
            self.backend.time().await
        } else {
            Ok(None)
        }
    }
}
