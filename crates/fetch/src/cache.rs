//! TTL response cache for parsed JSON bodies.

use std::time::Duration;

use {dashmap::DashMap, serde::Serialize, serde_json::Value, tokio::time::Instant};

/// Bookkeeping charged per entry on top of the serialized payload.
pub const ENTRY_OVERHEAD_BYTES: usize = 100;

struct CacheEntry {
    data: Value,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) >= self.ttl
    }
}

/// Snapshot returned by [`ResponseCache::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Unexpired entries.
    pub size: usize,
    pub estimated_bytes: usize,
}

/// Response cache keyed by [`crate::key::cache_key`]. Expired entries are
/// evicted lazily when read and whenever stats are taken.
#[derive(Default)]
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key)
            && !entry.is_expired(now)
        {
            return Some(entry.data.clone());
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    pub fn insert(&self, key: String, data: Value, ttl: Duration) {
        self.entries.insert(key, CacheEntry {
            data,
            stored_at: Instant::now(),
            ttl,
        });
    }

    /// Remove entries whose key contains `filter`, or everything when `None`.
    /// Returns how many were removed.
    pub fn clear(&self, filter: Option<&str>) -> usize {
        let before = self.entries.len();
        match filter {
            Some(needle) => self.entries.retain(|key, _| !key.contains(needle)),
            None => self.entries.clear(),
        }
        before.saturating_sub(self.entries.len())
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let estimated_bytes = self
            .entries
            .iter()
            .map(|entry| serialized_len(&entry.data) + ENTRY_OVERHEAD_BYTES)
            .sum();
        CacheStats {
            size: self.entries.len(),
            estimated_bytes,
        }
    }
}

fn serialized_len(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}
