//! Store construction for rule-driven limiters.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::kv::KvBackend;
use super::memory::MemoryStore;
use super::remote::{RemoteStore, RemoteStoreConfig};
use super::CounterStore;
use crate::error::{Result, WardenError};

/// Bounds shared by every state type a limiter keeps in a store.
pub trait StoredState:
    Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> StoredState for T where
    T: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Creates the store each rule's limiter keeps its state in.
pub trait StoreBuilder: Send + Sync + 'static {
    type Store<T: StoredState>: CounterStore<T> + 'static;

    /// A store for the limiter of rule `rule`.
    fn build<T: StoredState>(&self, rule: &str) -> Result<Self::Store<T>>;

    /// How long the store keeps state that is no longer written, if bounded.
    fn entry_ttl(&self) -> Option<Duration> {
        None
    }
}

/// One [`MemoryStore`] per rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcessStores;

impl StoreBuilder for InProcessStores {
    type Store<T: StoredState> = MemoryStore<T>;

    fn build<T: StoredState>(&self, _rule: &str) -> Result<MemoryStore<T>> {
        Ok(MemoryStore::new())
    }
}

/// One [`RemoteStore`] per rule over a shared backend, namespaced as
/// `{namespace}:{rule}` so rules never see each other's keys.
pub struct SharedStores<B> {
    backend: Arc<B>,
    config: RemoteStoreConfig,
}

impl<B> Debug for SharedStores<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStores")
            .field("config", &self.config)
            .finish()
    }
}

impl<B: KvBackend + 'static> SharedStores<B> {
    pub fn new(backend: Arc<B>, config: RemoteStoreConfig) -> Self {
        Self { backend, config }
    }
}

impl<B: KvBackend + 'static> StoreBuilder for SharedStores<B> {
    type Store<T: StoredState> = RemoteStore<B>;

    fn build<T: StoredState>(&self, rule: &str) -> Result<RemoteStore<B>> {
        if rule.contains(':') {
            return Err(WardenError::Config(format!(
                "rule name '{rule}' must not contain ':'"
            )));
        }
        let config = RemoteStoreConfig {
            namespace: format!("{}:{}", self.config.namespace, rule),
            ..self.config.clone()
        };
        RemoteStore::new(Arc::clone(&self.backend), config)
    }

    fn entry_ttl(&self) -> Option<Duration> {
        self.config.entry_ttl_secs.map(Duration::from_secs)
    }
}
