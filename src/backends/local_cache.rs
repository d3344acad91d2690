//! Local Cache - In-Process Fallback Tier
//!
//! Bounded Moka cache with per-entry expiry. All operations are synchronous.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use moka::sync::Cache;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{CacheConfig, LOCAL_TTL_CEILING};
use crate::key::GlobMatcher;

/// Cache entry with TTL information
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Bytes,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: &[u8], ttl: Duration) -> Self {
        Self {
            value: Bytes::copy_from_slice(value),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Configuration for [`LocalCache`]
#[derive(Debug, Clone, Copy)]
pub struct LocalCacheConfig {
    pub max_items: u64,
    /// Lifetime ceiling applied to every entry
    pub ttl: Duration,
    /// Larger values are refused
    pub max_item_bytes: usize,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            max_items: 1000,
            ttl: LOCAL_TTL_CEILING,
            max_item_bytes: 100 * 1024,
        }
    }
}

impl From<&CacheConfig> for LocalCacheConfig {
    fn from(config: &CacheConfig) -> Self {
        Self {
            max_items: config.local_max_items,
            ttl: config.local_ttl.min(LOCAL_TTL_CEILING),
            max_item_bytes: config.local_max_item_bytes,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LocalCacheStats {
    pub entries: u64,
    pub max_items: u64,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
}

/// Moka-backed local tier
///
/// Every entry holds its own copy of the serialized value, independent of
/// whatever the remote tier stores.
pub struct LocalCache {
    cache: Cache<String, CacheEntry>,
    config: LocalCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

impl LocalCache {
    pub fn new(config: LocalCacheConfig) -> Self {
        let ttl = config.ttl.min(LOCAL_TTL_CEILING);
        let cache = Cache::builder()
            .max_capacity(config.max_items)
            .time_to_live(ttl)
            .build();

        info!(
            capacity = config.max_items,
            ttl_secs = ttl.as_secs(),
            "Local fallback cache initialized"
        );

        Self {
            cache,
            config: LocalCacheConfig { ttl, ..config },
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        if let Some(entry) = self.cache.get(key) {
            if entry.is_expired() {
                self.cache.invalidate(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            } else {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value)
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Time left before a live entry expires
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        self.cache
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.expires_at.saturating_duration_since(Instant::now()))
    }

    /// Whether a value of this size would be accepted by [`LocalCache::insert`]
    pub fn accepts(&self, size: usize) -> bool {
        size <= self.config.max_item_bytes
    }

    /// Store a copy of `value`; returns `false` when it is over the size threshold
    ///
    /// The effective lifetime is `ttl` capped at the local ceiling.
    pub fn insert(&self, key: &str, value: &[u8], ttl: Duration) -> bool {
        if !self.accepts(value.len()) {
            debug!(key = %key, bytes = value.len(), "[Local] Value over size threshold, not cached");
            return false;
        }
        let ttl = ttl.min(self.config.ttl);
        self.cache.insert(key.to_string(), CacheEntry::new(value, ttl));
        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, ttl_ms = ttl.as_millis(), "[Local] Cached key with TTL");
        true
    }

    /// Remove one key; `true` if a live entry was removed
    pub fn remove(&self, key: &str) -> bool {
        self.cache
            .remove(key)
            .is_some_and(|entry| !entry.is_expired())
    }

    /// Remove every live entry whose key matches, returning the removed keys
    pub fn remove_matching(&self, matcher: &GlobMatcher) -> Vec<String> {
        let candidates: Vec<String> = self
            .cache
            .iter()
            .filter(|(key, _)| matcher.is_match(key))
            .map(|(key, _)| key.as_ref().clone())
            .collect();

        candidates
            .into_iter()
            .filter(|key| self.remove(key))
            .collect()
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let expired: Vec<String> = self
            .cache
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.as_ref().clone())
            .collect();
        for key in &expired {
            self.cache.invalidate(key);
        }
        self.cache.run_pending_tasks();
        expired.len()
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn stats(&self) -> LocalCacheStats {
        LocalCacheStats {
            entries: self.entry_count(),
            max_items: self.config.max_items,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &LocalCacheConfig {
        &self.config
    }

    /// Periodically purge expired entries until the cache is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!(purged, "[Local] Swept expired entries");
                }
            }
        })
    }
}
