//! In-process state store with one lock per identifier.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use super::CounterStore;
use crate::error::Result;

/// A state slot. `retired` is set under the slot lock when the slot is
/// removed from the map, so a decision that fetched the slot just before
/// eviction retries against a fresh one instead of writing into a detached
/// slot.
#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    retired: bool,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            value: None,
            retired: false,
        }
    }
}

/// In-process [`CounterStore`].
///
/// The map is only locked long enough to find or create an identifier's slot;
/// the read-modify-write itself runs under that slot's own mutex, so
/// decisions for different identifiers never wait on each other.
#[derive(Debug)]
pub struct MemoryStore<T> {
    slots: DashMap<String, Arc<Mutex<Slot<T>>>>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: DashMap::with_capacity(capacity),
        }
    }

    fn slot(&self, key: &str) -> Arc<Mutex<Slot<T>>> {
        if let Some(slot) = self.slots.get(key) {
            return Arc::clone(slot.value());
        }
        let slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Slot::empty())));
        Arc::clone(slot.value())
    }

    fn update_locked<R, F>(&self, key: &str, apply: F) -> R
    where
        F: Fn(Option<T>) -> (T, R),
    {
        loop {
            let slot = self.slot(key);
            let mut guard = slot.lock();
            if guard.retired {
                trace!(key = %key, "Slot retired during update, retrying");
                continue;
            }
            let (next, output) = apply(guard.value.take());
            guard.value = Some(next);
            return output;
        }
    }

    fn evict_unlocked<P>(&self, is_idle: P) -> usize
    where
        P: Fn(&T) -> bool,
    {
        let mut evicted = 0;
        self.slots.retain(|_, slot| {
            // A locked slot has a decision in flight and is not idle
            let Some(mut guard) = slot.try_lock() else {
                return true;
            };
            let idle = guard.value.as_ref().map_or(true, |value| is_idle(value));
            if idle {
                guard.retired = true;
                evicted += 1;
            }
            !idle
        });
        evicted
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> CounterStore<T> for MemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn update<R, F>(&self, key: &str, apply: F) -> Result<R>
    where
        F: Fn(Option<T>) -> (T, R) + Send + Sync,
        R: Send,
    {
        Ok(self.update_locked(key, apply))
    }

    async fn get(&self, key: &str) -> Result<Option<T>> {
        let slot = match self.slots.get(key) {
            Some(slot) => Arc::clone(slot.value()),
            None => return Ok(None),
        };
        let guard = slot.lock();
        Ok(if guard.retired {
            None
        } else {
            guard.value.clone()
        })
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let Some((_, slot)) = self.slots.remove(key) else {
            return Ok(false);
        };
        let mut guard = slot.lock();
        guard.retired = true;
        Ok(guard.value.is_some())
    }

    async fn evict<P>(&self, is_idle: P) -> Result<usize>
    where
        P: Fn(&T) -> bool + Send + Sync,
    {
        Ok(self.evict_unlocked(is_idle))
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.slots.len())
    }
}
