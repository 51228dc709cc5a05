//! Per-identifier state storage.
//!
//! A [`CounterStore`] owns every identifier's limiter state and is the only
//! place where atomicity is enforced. The in-process [`MemoryStore`] locks
//! each identifier separately; the [`RemoteStore`] adapts any shared
//! [`KvBackend`] through optimistic compare-and-swap so several instances
//! can enforce one limit.

mod builder;
mod kv;
mod memory;
mod remote;

pub use builder::{InProcessStores, SharedStores, StoreBuilder, StoredState};
pub use kv::{KvBackend, MemoryKv, Versioned};
pub use memory::MemoryStore;
pub use remote::{RemoteStore, RemoteStoreConfig};

use async_trait::async_trait;

use crate::clock::Timestamp;
use crate::error::Result;

/// Trait for limiter state stores.
///
/// This trait abstracts over the in-process and shared-store implementations
/// so a limiter can be bound to either.
#[async_trait]
pub trait CounterStore<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Atomically read-modify-write the state stored under `key`.
    ///
    /// `apply` receives the current state (`None` on first access) and
    /// returns the state to commit together with a result for the caller.
    /// It must be free of side effects: implementations may invoke it more
    /// than once when a concurrent writer wins a race.
    async fn update<R, F>(&self, key: &str, apply: F) -> Result<R>
    where
        F: Fn(Option<T>) -> (T, R) + Send + Sync,
        R: Send;

    /// Read the state stored under `key` without modifying it.
    async fn get(&self, key: &str) -> Result<Option<T>>;

    /// Remove the state stored under `key`. Returns whether it existed.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Remove every entry for which `is_idle` holds. Returns how many were
    /// removed.
    async fn evict<P>(&self, is_idle: P) -> Result<usize>
    where
        P: Fn(&T) -> bool + Send + Sync;

    /// Number of identifiers with stored state.
    async fn len(&self) -> Result<usize>;

    /// The store's own notion of the current time, if it provides one.
    ///
    /// Shared stores can attach a single time source so every instance
    /// evaluates decisions against the same clock.
    async fn now(&self) -> Result<Option<Timestamp>> {
        Ok(None)
    }
}
