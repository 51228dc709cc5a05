//! Contract for shared key/value backends.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::clock::{Clock, MonotonicClock, Timestamp};
use crate::error::{Result, WardenError};

/// A stored value together with the version it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub value: Vec<u8>,
}

/// Operations a shared store must provide to back a
/// [`RemoteStore`](super::RemoteStore).
///
/// Every method may fail with [`WardenError::StoreUnavailable`] when the
/// backend cannot be reached.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Fetch the current value and version of `key`.
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Write `value` only if the current version of `key` equals `expected`
    /// (`None` meaning the key must not exist). Returns whether the write
    /// happened. `ttl` lets the backend expire keys that stop being written.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Delete `key` only if its current version equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: u64) -> Result<bool>;

    /// Delete `key` unconditionally. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// The backend's own time, when it attaches timestamps.
    async fn time(&self) -> Result<Option<Timestamp>> {
        Ok(None)
    }
}

#[derive(Debug)]
struct KvEntry {
    version: u64,
    value: Vec<u8>,
    expires_at: Option<Timestamp>,
}

impl KvEntry {
    fn live(&self, now: Timestamp) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

/// An in-process [`KvBackend`].
///
/// Behaves like a single shared store instance: every [`RemoteStore`]
/// pointed at the same `MemoryKv` sees the same data. It can be switched
/// unavailable to exercise failure handling.
///
/// [`RemoteStore`]: super::RemoteStore
pub struct MemoryKv {
    entries: Mutex<HashMap<String, KvEntry>>,
    next_version: AtomicU64,
    available: AtomicBool,
    attach_time: bool,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for MemoryKv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryKv")
            .field("keys", &self.entries.lock().len())
            .field("available", &self.available.load(Ordering::SeqCst))
            .field("attach_time", &self.attach_time)
            .finish()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    /// Use `clock` for key expiry (and for [`KvBackend::time`] when time is
    /// attached).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            available: AtomicBool::new(true),
            attach_time: false,
            clock,
        }
    }

    /// Report the backend clock from [`KvBackend::time`].
    pub fn with_attached_time(mut self) -> Self {
        self.attach_time = true;
        self
    }

    /// Simulate the backend becoming reachable or unreachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WardenError::StoreUnavailable(
                "in-memory backend is marked unavailable".to_string(),
            ))
        }
    }

    /// Current version of a live key, dropping it if it has expired.
    fn live_version(entries: &mut HashMap<String, KvEntry>, key: &str, now: Timestamp) -> Option<u64> {
        match entries.get(key) {
            Some(entry) if entry.live(now) => Some(entry.version),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        if Self::live_version(&mut entries, key, now).is_none() {
            return Ok(None);
        }
        Ok(entries.get(key).map(|entry| Versioned {
            version: entry.version,
            value: entry.value.clone(),
        }))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        if Self::live_version(&mut entries, key, now) != expected {
            return Ok(false);
        }
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        entries.insert(
            key.to_string(),
            KvEntry {
                version,
                value,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: u64) -> Result<bool> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        if Self::live_version(&mut entries, key, now) != Some(expected) {
            return Ok(false);
        }
        entries.remove(key);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let existed = Self::live_version(&mut entries, key, now).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.live(now));
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn time(&self) -> Result<Option<Timestamp>> {
        self.check_available()?;
        Ok(self.attach_time.then(|| self.clock.now()))
    }
}
