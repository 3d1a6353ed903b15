//! Bounded, TTL'd result cache with disk snapshots.

mod snapshot;

pub use snapshot::{PatternFilter, RetainAll, SnapshotFilter, load_snapshot, save_snapshot};

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CacheConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    pub created_at_ms: i64,
    pub last_access_ms: i64,
    pub ttl_ms: u64,
}

impl CacheEntry {
    fn expired_at(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) >= self.ttl_ms as i64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub evictions: u64,
    pub size: usize,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    total_requests: u64,
    evictions: u64,
}

pub struct ResultCache {
    max_size: usize,
    default_ttl: Duration,
    inner: Mutex<CacheInner>,
}

impl ResultCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            max_size: config.max_size,
            default_ttl: Duration::from_millis(config.default_ttl_ms),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Look up `key`. Counts every request; an expired entry is purged and
    /// counted as a miss, a hit refreshes `last_access`.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let now_ms = Self::now_ms();
        let mut inner = self.inner.lock();
        inner.total_requests += 1;

        let live = match inner.entries.get(key) {
            Some(entry) => !entry.expired_at(now_ms),
            None => {
                inner.misses += 1;
                return None;
            }
        };
        if !live {
            inner.entries.remove(key);
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        let entry = inner.entries.get_mut(key)?;
        entry.last_access_ms = now_ms;
        Some(entry.value.clone())
    }

    pub fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) {
        let now_ms = Self::now_ms();
        let ttl_ms = ttl.unwrap_or(self.default_ttl).as_millis() as u64;
        let mut inner = self.inner.lock();
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at_ms: now_ms,
                last_access_ms: now_ms,
                ttl_ms,
            },
        );
        if inner.entries.len() > self.max_size {
            Self::evict_oldest(&mut inner, self.max_size);
        }
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.lock().entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Evict the least-recently-accessed ~10% (at least one entry) once the
    /// size bound is exceeded.
    fn evict_oldest(inner: &mut CacheInner, max_size: usize) {
        let excess = inner.entries.len().saturating_sub(max_size);
        let batch = (max_size / 10).max(1).max(excess);

        let mut by_access: Vec<(String, i64)> = inner
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.last_access_ms))
            .collect();
        by_access.sort_by_key(|(_, last_access)| *last_access);

        for (key, _) in by_access.into_iter().take(batch) {
            inner.entries.remove(&key);
            inner.evictions += 1;
        }
        debug!(evicted = batch, remaining = inner.entries.len(), "Cache eviction");
    }

    /// Purge TTL-expired entries independent of access.
    pub fn sweep(&self) -> usize {
        let now_ms = Self::now_ms();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !e.expired_at(now_ms));
        let purged = before - inner.entries.len();
        if purged > 0 {
            debug!(purged, "Cache sweep purged expired entries");
        }
        purged
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            total_requests: inner.total_requests,
            evictions: inner.evictions,
            size: inner.entries.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot view of all live entries, for persistence.
    pub(crate) fn export_entries(&self) -> HashMap<String, CacheEntry> {
        let now_ms = Self::now_ms();
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| !e.expired_at(now_ms))
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }

    /// Merge entries loaded from disk. Existing keys win; an entry is only
    /// admitted while still inside its TTL.
    pub(crate) fn import_entries(&self, entries: HashMap<String, CacheEntry>) -> usize {
        let now_ms = Self::now_ms();
        let mut inner = self.inner.lock();
        let mut admitted = 0;
        for (key, entry) in entries {
            if entry.expired_at(now_ms) || inner.entries.contains_key(&key) {
                continue;
            }
            inner.entries.insert(key, entry);
            admitted += 1;
        }
        if inner.entries.len() > self.max_size {
            Self::evict_oldest(&mut inner, self.max_size);
        }
        admitted
    }
}
