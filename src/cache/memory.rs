// In-process query cache.
// Memory tier with per-key expiry timers, written through to the persistent store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::{SharedClock, elapsed_since};

use super::store::{DEFAULT_TTL, PersistentStore, StoreStats};

#[derive(Debug)]
struct MemoryEntry {
    value: Value,
    timestamp: DateTime<Utc>,
    ttl: Duration,
}

#[derive(Debug)]
struct ExpiryTimer {
    id: u64,
    handle: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, MemoryEntry>,
    timers: HashMap<String, ExpiryTimer>,
    generations: HashMap<String, u64>,
    /// Keys whose durable record may be older than memory; never promoted.
    unpersisted: HashSet<String>,
    cleared: u64,
    next_timer_id: u64,
}

impl Inner {
    fn cancel_timer(&mut self, key: &str) {
        if let Some(timer) = self.timers.remove(key) {
            timer.handle.abort();
        }
    }

    fn cancel_all_timers(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
    }
}

/// Invalidation generation of a key.
///
/// Taken before a fetch starts; if the key is invalidated or the cache cleared in the
/// meantime the epoch no longer matches and the fetched result must not be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Epoch {
    cleared: u64,
    key: u64,
}

/// Two-tier cache: process memory in front of a [`PersistentStore`].
pub struct QueryCache {
    inner: Arc<Mutex<Inner>>,
    store: Arc<PersistentStore>,
    clock: SharedClock,
    default_ttl: Duration,
}

impl QueryCache {
    pub fn new(store: Arc<PersistentStore>, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            store,
            clock,
            default_ttl: DEFAULT_TTL,
        }
    }

    /// TTL given to entries restored from the persistent store.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.store
    }

    /// Store `value` under `key` for `ttl`, replacing any previous entry and timer.
    pub fn set(&self, key: &str, value: Value, ttl: Duration) {
        let persisted = self.persist(key, &value, ttl);
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, key, value, ttl, persisted);
    }

    /// Store `value` only if `key` has not been invalidated since `epoch` was taken.
    pub fn set_if_current(&self, key: &str, epoch: Epoch, value: Value, ttl: Duration) -> bool {
        if self.epoch(key) != epoch {
            debug!(key, "Discarding result fetched before invalidation");
            return false;
        }

        let persisted = self.persist(key, &value, ttl);
        let mut inner = self.inner.lock();
        if Self::epoch_locked(&inner, key) != epoch {
            drop(inner);
            debug!(key, "Invalidated while persisting, discarding result");
            if persisted {
                self.remove_durable(key);
            }
            return false;
        }
        self.insert_locked(&mut inner, key, value, ttl, persisted);
        true
    }

    /// Write the durable tier, outside the memory lock. Returns whether it took the value.
    ///
    /// A failed write also drops any older record so it cannot be promoted later.
    fn persist(&self, key: &str, value: &Value, ttl: Duration) -> bool {
        match self.store.set(key, value, ttl) {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "Failed to persist cache entry");
                if let Err(e) = self.store.remove(key) {
                    debug!(key, error = %e, "Failed to drop older persisted entry");
                }
                false
            }
        }
    }

    /// Remove the durable record; if that fails, stop trusting it.
    fn remove_durable(&self, key: &str) {
        if let Err(e) = self.store.remove(key) {
            warn!(key, error = %e, "Failed to remove persisted cache entry");
            self.inner.lock().unpersisted.insert(key.to_string());
        }
    }

    fn insert_locked(
        &self,
        inner: &mut Inner,
        key: &str,
        value: Value,
        ttl: Duration,
        persisted: bool,
    ) {
        if persisted {
            inner.unpersisted.remove(key);
        } else {
            inner.unpersisted.insert(key.to_string());
        }

        inner.entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                timestamp: self.clock.now(),
                ttl,
            },
        );
        self.schedule_expiry(inner, key, ttl);
    }

    fn schedule_expiry(&self, inner: &mut Inner, key: &str, ttl: Duration) {
        inner.cancel_timer(key);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(key, "No runtime, entry will expire lazily");
            return;
        };

        inner.next_timer_id += 1;
        let id = inner.next_timer_id;
        let deadline = tokio::time::Instant::now() + ttl;
        let shared: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        let store = Arc::clone(&self.store);
        let timer_key = key.to_string();

        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;

            let Some(shared) = shared.upgrade() else {
                return;
            };
            let expired = {
                let mut inner = shared.lock();
                if inner.timers.get(&timer_key).is_some_and(|t| t.id == id) {
                    inner.timers.remove(&timer_key);
                    inner.entries.remove(&timer_key);
                    true
                } else {
                    false
                }
            };

            if expired {
                debug!(key = %timer_key, "Cache entry expired");
                if let Err(e) = store.remove(&timer_key) {
                    warn!(key = %timer_key, error = %e, "Failed to remove expired entry");
                }
            }
        });

        inner
            .timers
            .insert(key.to_string(), ExpiryTimer { id, handle });
    }

    /// Get the value under `key`, falling back to the persistent store on a miss.
    pub fn get(&self, key: &str) -> Option<Value> {
        {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.entries.get(key) {
                if elapsed_since(self.clock.as_ref(), entry.timestamp) < entry.ttl {
                    debug!(key, "Memory cache hit");
                    return Some(entry.value.clone());
                }
                inner.entries.remove(key);
                inner.cancel_timer(key);
            }
            if inner.unpersisted.contains(key) {
                debug!(key, "Persisted copy is out of date, treating as miss");
                return None;
            }
        }

        let value = self.store.get(key)?;
        debug!(key, "Restored cache entry from persistent store");
        self.set(key, value.clone(), self.default_ttl);
        Some(value)
    }

    /// Remove `key` from both tiers.
    pub fn invalidate(&self, key: &str) {
        {
            let mut inner = self.inner.lock();
            inner.entries.remove(key);
            inner.cancel_timer(key);
            *inner.generations.entry(key.to_string()).or_default() += 1;
        }
        self.remove_durable(key);
    }

    /// Remove every entry from both tiers.
    pub fn clear(&self) {
        let resident: Vec<String> = {
            let mut inner = self.inner.lock();
            inner.cancel_all_timers();
            inner.cleared += 1;
            inner.entries.drain().map(|(key, _)| key).collect()
        };
        match self.store.clear() {
            Ok(()) => self.inner.lock().unpersisted.clear(),
            Err(e) => {
                warn!(error = %e, "Failed to clear persistent cache");
                self.inner.lock().unpersisted.extend(resident);
            }
        }
    }

    /// True if `key` has no entry or its entry is at least `stale_after` old.
    pub fn is_stale(&self, key: &str, stale_after: Duration) -> bool {
        {
            let inner = self.inner.lock();
            if let Some(entry) = inner.entries.get(key) {
                return elapsed_since(self.clock.as_ref(), entry.timestamp) >= stale_after;
            }
            if inner.unpersisted.contains(key) {
                return true;
            }
        }
        self.store.is_stale(key, stale_after)
    }

    pub fn epoch(&self, key: &str) -> Epoch {
        Self::epoch_locked(&self.inner.lock(), key)
    }

    fn epoch_locked(inner: &Inner, key: &str) -> Epoch {
        Epoch {
            cleared: inner.cleared,
            key: inner.generations.get(key).copied().unwrap_or(0),
        }
    }

    /// Number of live expiry timers.
    pub fn timer_count(&self) -> usize {
        self.inner.lock().timers.len()
    }

    /// Number of entries resident in memory (expired ones included until evicted).
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Cancel every expiry timer; entries stay and expire lazily.
    pub fn shutdown(&self) {
        self.inner.lock().cancel_all_timers();
    }
}

impl Drop for QueryCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}
