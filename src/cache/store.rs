// Persistent store adapter.
// Namespaced, size-budgeted JSON entries with TTL bookkeeping on top of a durable backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::clock::{SharedClock, elapsed_since};

use super::backend::{StorageBackend, StorageError};

/// Default prefix for keys owned by the store.
pub const DEFAULT_PREFIX: &str = "wecare_cache_";

/// Default size budget: 5 MiB.
pub const DEFAULT_MAX_BYTES: usize = 5 * 1024 * 1024;

/// Default TTL for entries: 5 minutes.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Fraction of the budget eviction shrinks usage down to.
const EVICTION_TARGET: f64 = 0.8;

/// Wrapper for cached data with metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    /// The cached data.
    pub data: T,
    /// When the data was cached.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Lifetime in milliseconds.
    pub ttl: u64,
    /// Approximate size of the serialized data in bytes.
    #[serde(default)]
    pub size: usize,
}

impl<T> CachedData<T> {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl)
    }

    /// Check if this cached data has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let elapsed = now
            .signed_duration_since(self.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO);
        elapsed >= self.ttl()
    }
}

/// Snapshot of the store's contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub count: usize,
    pub size: usize,
    pub expired: usize,
}

impl StoreStats {
    pub fn size_formatted(&self) -> String {
        format_bytes(self.size)
    }
}

/// Format a byte count as "0 B", "512 B", "1.5 KB", ...
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let formatted = format!("{:.2}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, UNITS[unit])
}

/// Best-effort durable cache tier.
///
/// Reads never fail: missing, expired, corrupt and unreadable entries all come back as
/// `None`. Writes report a typed [`StorageError`] which callers are free to ignore.
pub struct PersistentStore {
    backend: Arc<dyn StorageBackend>,
    clock: SharedClock,
    prefix: String,
    max_bytes: usize,
}

impl PersistentStore {
    pub fn new(backend: Arc<dyn StorageBackend>, clock: SharedClock) -> Self {
        Self {
            backend,
            clock,
            prefix: DEFAULT_PREFIX.to_string(),
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn own_keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .backend
            .keys()?
            .into_iter()
            .filter(|k| k.starts_with(&self.prefix))
            .collect())
    }

    fn read_record(&self, key: &str) -> Option<CachedData<Value>> {
        let namespaced = self.namespaced(key);
        let raw = match self.backend.get_item(&namespaced) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "Failed to read cached data");
                return None;
            }
        };

        match serde_json::from_str::<CachedData<Value>>(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key, error = %e, "Removing corrupt cache entry");
                self.remove_quietly(&namespaced);
                None
            }
        }
    }

    fn remove_quietly(&self, namespaced: &str) {
        if let Err(e) = self.backend.remove_item(namespaced) {
            warn!(key = namespaced, error = %e, "Failed to remove cached data");
        }
    }

    /// Store `value` under `key` for `ttl`.
    pub fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), StorageError> {
        let size = serde_json::to_string(value)?.len();
        let record = CachedData {
            data: value,
            timestamp: self.clock.now(),
            ttl: ttl.as_millis().try_into().unwrap_or(u64::MAX),
            size,
        };
        let serialized = serde_json::to_string(&record)?;

        if self.usage() + serialized.len() > self.max_bytes {
            debug!(key, "Cache over budget, cleaning up before write");
            if let Err(e) = self.cleanup() {
                warn!(error = %e, "Cache cleanup failed");
            }
        }

        self.backend.set_item(&self.namespaced(key), &serialized)
    }

    /// Get the value under `key` if present and not expired.
    pub fn get(&self, key: &str) -> Option<Value> {
        let record = self.read_record(key)?;
        if record.is_expired(self.clock.now()) {
            self.remove_quietly(&self.namespaced(key));
            return None;
        }
        Some(record.data)
    }

    /// True if there is no readable entry or it is older than `stale_after`.
    pub fn is_stale(&self, key: &str, stale_after: Duration) -> bool {
        match self.read_record(key) {
            Some(record) => elapsed_since(self.clock.as_ref(), record.timestamp) >= stale_after,
            None => true,
        }
    }

    pub fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.backend.remove_item(&self.namespaced(key))
    }

    /// Remove every entry under this store's prefix, leaving other keys alone.
    pub fn clear(&self) -> Result<(), StorageError> {
        for key in self.own_keys()? {
            self.backend.remove_item(&key)?;
        }
        Ok(())
    }

    /// Bytes currently used by this store's entries.
    pub fn usage(&self) -> usize {
        let keys = match self.own_keys() {
            Ok(keys) => keys,
            Err(_) => return 0,
        };
        keys.iter()
            .filter_map(|k| self.backend.get_item(k).ok().flatten())
            .map(|v| v.len())
            .sum()
    }

    /// Purge expired and corrupt entries, then evict oldest-first while over budget.
    pub fn cleanup(&self) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut live: Vec<(String, DateTime<Utc>, usize)> = Vec::new();

        for key in self.own_keys()? {
            let Some(raw) = self.backend.get_item(&key)? else {
                continue;
            };
            match serde_json::from_str::<CachedData<Value>>(&raw) {
                Ok(record) if record.is_expired(now) => self.backend.remove_item(&key)?,
                Ok(record) => live.push((key, record.timestamp, raw.len())),
                Err(_) => self.backend.remove_item(&key)?,
            }
        }

        let mut usage: usize = live.iter().map(|(_, _, len)| len).sum();
        if usage <= self.max_bytes {
            return Ok(());
        }

        live.sort_by_key(|(_, timestamp, _)| *timestamp);
        let target = (self.max_bytes as f64 * EVICTION_TARGET) as usize;
        let mut evicted = 0;
        for (key, _, len) in live {
            if usage <= target {
                break;
            }
            self.backend.remove_item(&key)?;
            usage = usage.saturating_sub(len);
            evicted += 1;
        }
        debug!(evicted, usage, "Evicted oldest cache entries");

        Ok(())
    }

    pub fn stats(&self) -> StoreStats {
        let Ok(keys) = self.own_keys() else {
            return StoreStats::default();
        };

        let now = self.clock.now();
        let mut stats = StoreStats::default();
        for key in keys {
            let Some(raw) = self.backend.get_item(&key).ok().flatten() else {
                continue;
            };
            stats.count += 1;
            stats.size += raw.len();
            match serde_json::from_str::<CachedData<Value>>(&raw) {
                Ok(record) if !record.is_expired(now) => {}
                _ => stats.expired += 1,
            }
        }
        stats
    }
}
