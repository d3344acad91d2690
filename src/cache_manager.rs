//! Cache Manager - Unified Cache Operations
//!
//! Orchestrates the local fallback tier, the remote tier and the memory
//! governor. The public operations form a no-throw boundary: cache failures
//! degrade to misses, `false` or `0`, never to errors. Only a caller-supplied
//! factory in [`CacheManager::get_or_set`] can return an error.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backends::{LocalCache, LocalCacheStats};
use crate::config::CacheConfig;
use crate::error::RemoteError;
use crate::events::{CacheEvent, EventBus};
use crate::governor::{MemoryGovernor, MemoryStats, NamespaceUsage, parse_info};
use crate::key::GlobMatcher;
use crate::metrics::{CacheMetrics, HitSource, OperationCounters};
use crate::options::{CacheOptions, Priority};
use crate::remote::{AvailabilityState, RemoteClient};

const SCAN_PAGE: usize = 100;

/// RAII cleanup guard for in-flight request tracking
/// Ensures that entries are removed from DashMap even on early return or panic
struct CleanupGuard<'a> {
    map: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// Server fields reported by `INFO`
#[derive(Debug, Clone, Default, Serialize)]
pub struct RemoteInfo {
    pub version: Option<String>,
    pub uptime_secs: Option<u64>,
    pub connected_clients: Option<u64>,
    pub total_commands: Option<u64>,
    pub keyspace_hits: Option<u64>,
    pub keyspace_misses: Option<u64>,
}

impl RemoteInfo {
    fn from_info(text: &str) -> Self {
        let info = parse_info(text);
        let number = |field: &str| info.get(field).and_then(|v| v.parse().ok());
        Self {
            version: info.get("redis_version").cloned(),
            uptime_secs: number("uptime_in_seconds"),
            connected_clients: number("connected_clients"),
            total_commands: number("total_commands_processed"),
            keyspace_hits: number("keyspace_hits"),
            keyspace_misses: number("keyspace_misses"),
        }
    }
}

/// Combined snapshot returned by [`CacheManager::stats`]
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub backend: &'static str,
    pub availability: AvailabilityState,
    pub remote: RemoteInfo,
    pub memory: MemoryStats,
    pub local: LocalCacheStats,
    pub operations: OperationCounters,
    pub top_namespaces: Vec<NamespaceUsage>,
    pub in_flight_requests: usize,
}

/// Cache Manager - unified operations across the local and remote tiers
///
/// Cloning is cheap; every clone shares the same tiers and background tasks.
#[derive(Clone)]
pub struct CacheManager {
    config: Arc<CacheConfig>,
    remote: Arc<RemoteClient>,
    local: Arc<LocalCache>,
    governor: Arc<MemoryGovernor>,
    metrics: Arc<CacheMetrics>,
    events: EventBus,
    /// In-flight requests to prevent Cache Stampede on factory calls
    in_flight_requests: Arc<DashMap<String, Arc<Mutex<()>>>>,
    background: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
    closed: Arc<AtomicBool>,
}

impl CacheManager {
    pub(crate) fn from_parts(
        config: CacheConfig,
        remote: Arc<RemoteClient>,
        local: Arc<LocalCache>,
        governor: Arc<MemoryGovernor>,
        metrics: Arc<CacheMetrics>,
        events: EventBus,
        background: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            remote,
            local,
            governor,
            metrics,
            events,
            in_flight_requests: Arc::new(DashMap::new()),
            background: Arc::new(parking_lot::Mutex::new(background)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start building a manager
    pub fn builder() -> crate::builder::CacheManagerBuilder {
        crate::builder::CacheManagerBuilder::new()
    }

    // ===== Reads =====

    /// Read a value, local tier first, then the remote tier
    ///
    /// Returns `None` on a miss, on any cache failure, when the stored payload
    /// does not deserialize as `T`, and for low-priority reads while memory
    /// usage is at or above the critical threshold.
    pub async fn get<T: DeserializeOwned>(&self, key: &str, options: &CacheOptions) -> Option<T> {
        self.metrics
            .timed("get", key, self.get_inner(key, options))
            .await
    }

    async fn get_inner<T: DeserializeOwned>(&self, key: &str, options: &CacheOptions) -> Option<T> {
        if options.priority == Priority::Low
            && self.governor.usage_pct() >= self.governor.critical_threshold()
        {
            debug!(key = %key, "Skipping low-priority read at critical memory usage");
            self.metrics.record_skip("get", "memory_critical");
            return None;
        }

        if options.use_local_fallback {
            if let Some(bytes) = self.local.get(key) {
                match serde_json::from_slice::<T>(&bytes) {
                    Ok(value) => {
                        debug!(key = %key, "[Local HIT]");
                        self.metrics.record_hit(HitSource::Local, key);
                        return Some(value);
                    }
                    Err(err) => {
                        warn!(key = %key, error = %err, "Malformed local cache entry, dropping it");
                        self.metrics.record_error("get", "serialization");
                        self.local.remove(key);
                    }
                }
            }
        }

        if !self.remote.is_available() {
            self.metrics.record_miss(key);
            return None;
        }

        match self.remote.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => {
                    if options.use_local_fallback {
                        if let Some(ttl) = self.mirror_ttl(key).await {
                            self.local.insert(key, &bytes, ttl);
                        }
                    }
                    debug!(key = %key, "[Remote HIT]");
                    self.metrics.record_hit(HitSource::Remote, key);
                    Some(value)
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "Malformed remote cache payload, treating as miss");
                    self.metrics.record_error("get", "serialization");
                    self.metrics.record_miss(key);
                    None
                }
            },
            Ok(None) => {
                self.metrics.record_miss(key);
                None
            }
            Err(err) => {
                if !err.is_connection_class() {
                    warn!(key = %key, error = %err, "Remote cache read failed");
                }
                self.metrics.record_error("get", err.kind());
                self.metrics.record_miss(key);
                None
            }
        }
    }

    /// Local lifetime for a value just read from the remote tier
    ///
    /// Never outlives the remote entry; `None` when it is about to expire.
    async fn mirror_ttl(&self, key: &str) -> Option<Duration> {
        let local = self.config.local_ttl_for(self.config.default_ttl);
        match self.remote.ttl(key).await {
            Ok(secs) if secs > 0 => {
                Some(local.min(Duration::from_secs(secs.unsigned_abs())))
            }
            Ok(-1) => Some(local),
            Ok(_) => None,
            Err(err) => {
                debug!(key = %key, error = %err, "Remote TTL unavailable, mirroring with default lifetime");
                Some(local)
            }
        }
    }

    // ===== Writes =====

    /// Store a value in both tiers
    ///
    /// `ttl` wins over `options.ttl`, which wins over the configured default.
    /// Returns `true` if at least one tier accepted the value.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        options: &CacheOptions,
    ) -> bool {
        self.metrics
            .timed("set", key, self.set_inner(key, value, ttl, options))
            .await
    }

    async fn set_inner<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        options: &CacheOptions,
    ) -> bool {
        if options.priority == Priority::Low
            && self.governor.usage_pct() >= self.governor.warning_threshold()
        {
            debug!(key = %key, "Skipping low-priority write at warning memory usage");
            self.metrics.record_skip("set", "memory_warning");
            return false;
        }

        let payload = match serde_json::to_vec(value) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(key = %key, error = %err, "Failed to serialize cache value");
                self.metrics.record_error("set", "serialization");
                return false;
            }
        };
        let size = payload.len();
        if size > self.config.max_item_bytes {
            warn!(key = %key, bytes = size, limit = self.config.max_item_bytes, "Cache value too large, not cached");
            self.metrics.record_oversized(size);
            return false;
        }

        let requested = ttl.or(options.ttl).unwrap_or(self.config.default_ttl);
        let ttl = self.effective_ttl(key, requested, size);

        let local_ok = options.use_local_fallback
            && self
                .local
                .insert(key, &payload, self.config.local_ttl_for(ttl));
        if local_ok {
            self.metrics.record_set("local");
        }

        if !self.remote.is_available() {
            debug!(key = %key, "Remote cache unavailable, stored locally only");
            return local_ok;
        }

        if options.fire_and_forget() {
            let this = self.clone();
            let key = key.to_string();
            let options = options.clone();
            tokio::spawn(async move {
                this.write_remote(&key, &payload, ttl, &options).await;
            });
            return local_ok;
        }

        self.write_remote(key, &payload, ttl, options).await || local_ok
    }

    /// Shrink the lifetime of large values to a third, floored at the minimum
    fn effective_ttl(&self, key: &str, ttl: Duration, size: usize) -> Duration {
        if size <= self.config.large_item_bytes {
            return ttl;
        }
        let shrunk = (ttl / 3).max(self.config.large_item_min_ttl).min(ttl);
        debug!(
            key = %key,
            bytes = size,
            ttl_secs = shrunk.as_secs(),
            "Large cache value, shortened TTL"
        );
        shrunk
    }

    async fn write_remote(
        &self,
        key: &str,
        payload: &[u8],
        ttl: Duration,
        options: &CacheOptions,
    ) -> bool {
        self.governor.evict_if_projected(payload.len()).await;

        match self
            .with_retry("set", options, move || self.remote.set_ex(key, payload, ttl))
            .await
        {
            Ok(()) => {
                debug!(key = %key, ttl_secs = ttl.as_secs(), "[Remote] Stored");
                self.metrics.record_set("remote");
                true
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Remote cache write failed, local tier only");
                false
            }
        }
    }

    /// Retry envelope shared by every remote operation
    ///
    /// Connection-class errors end the loop at once. Memory-class errors run
    /// an eviction pass before the next attempt. The delay grows linearly with
    /// the attempt number, capped at the configured maximum.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        options: &CacheOptions,
        mut call: F,
    ) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let max_retries = if options.retry {
            options.max_retries.unwrap_or(self.config.max_retries)
        } else {
            0
        };
        let base_delay = options.retry_delay.unwrap_or(self.config.retry_delay);
        let mut attempt = 0u32;

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    self.metrics.record_error(operation, err.kind());
                    if err.is_connection_class() || attempt >= max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    if err.is_memory_class() {
                        warn!(operation, attempt, "Remote cache out of memory, evicting before retry");
                        self.governor.evict().await;
                    } else {
                        debug!(operation, attempt, error = %err, "Retrying remote cache operation");
                    }
                    let delay = base_delay
                        .saturating_mul(attempt)
                        .min(self.config.max_retry_delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    // ===== Deletes =====

    /// Remove one key from both tiers; returns 1 if either tier held it
    pub async fn del(&self, key: &str, options: &CacheOptions) -> u64 {
        self.metrics
            .timed("del", key, self.del_inner(key, options))
            .await
    }

    async fn del_inner(&self, key: &str, options: &CacheOptions) -> u64 {
        let local_removed = self.local.remove(key);
        let mut remote_removed = false;

        if self.remote.is_available() {
            match self
                .with_retry("del", options, move || self.remote.del(key))
                .await
            {
                Ok(count) => remote_removed = count > 0,
                Err(err) => warn!(key = %key, error = %err, "Remote cache delete failed"),
            }
        }

        let removed = u64::from(local_removed || remote_removed);
        self.metrics.record_delete(removed);
        debug!(key = %key, removed, "Cache key deleted");
        removed
    }

    /// Remove every key matching a Redis glob from both tiers
    ///
    /// The local tier is cleared first and synchronously. Returns the number
    /// of distinct keys removed from either tier.
    pub async fn del_by_pattern(&self, pattern: &str, options: &CacheOptions) -> u64 {
        self.metrics
            .timed("del_by_pattern", pattern, self.del_by_pattern_inner(pattern, options))
            .await
    }

    async fn del_by_pattern_inner(&self, pattern: &str, options: &CacheOptions) -> u64 {
        let mut removed: HashSet<String> = HashSet::new();

        match GlobMatcher::new(pattern) {
            Ok(matcher) => removed.extend(self.local.remove_matching(&matcher)),
            Err(err) => {
                warn!(pattern = %pattern, error = %err, "Invalid cache key pattern, local tier not cleared");
            }
        }

        if self.remote.is_available() {
            if let Err(err) = self.del_remote_matching(pattern, options, &mut removed).await {
                warn!(pattern = %pattern, error = %err, "Remote pattern invalidation incomplete");
            }
        }

        let count = removed.len() as u64;
        self.metrics.record_invalidation(pattern, count);
        if count == 0 {
            debug!(pattern = %pattern, "Pattern invalidation matched nothing");
        } else {
            info!(pattern = %pattern, removed = count, "Invalidated cache keys by pattern");
        }
        count
    }

    async fn del_remote_matching(
        &self,
        pattern: &str,
        options: &CacheOptions,
        removed: &mut HashSet<String>,
    ) -> Result<(), RemoteError> {
        let mut cursor = 0u64;
        loop {
            let (next, keys) = self
                .with_retry("scan", options, move || {
                    self.remote.scan_match(cursor, pattern, SCAN_PAGE)
                })
                .await?;

            if let [key] = keys.as_slice() {
                let key = key.as_str();
                let count = self
                    .with_retry("del", options, move || self.remote.del(key))
                    .await?;
                if count > 0 {
                    removed.insert(key.to_string());
                }
            } else if !keys.is_empty() {
                let batch = keys.as_slice();
                let counts = self
                    .with_retry("pipeline_del", options, move || {
                        self.remote.pipeline_del(batch)
                    })
                    .await?;
                removed.extend(
                    keys.iter()
                        .zip(counts)
                        .filter(|(_, count)| *count > 0)
                        .map(|(key, _)| key.clone()),
                );
            }

            cursor = next;
            if cursor == 0 {
                return Ok(());
            }
        }
    }

    // ===== Compute =====

    /// Read `key`, or compute it with `factory`, store it and return it
    ///
    /// Concurrent callers for the same missing key are coalesced: only the
    /// first runs the factory, the rest wait and read its result.
    ///
    /// # Errors
    ///
    /// Returns the factory's error unchanged. Cache failures never surface.
    pub async fn get_or_set<T, F, Fut>(
        &self,
        key: &str,
        factory: F,
        ttl: Option<Duration>,
    ) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let options = CacheOptions::default();
        if let Some(value) = self.get(key, &options).await {
            return Ok(value);
        }

        let key_owned = key.to_string();
        let lock_guard = self
            .in_flight_requests
            .entry(key_owned.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let _guard = lock_guard.lock().await;

        // RAII cleanup guard - ensures entry is removed even on early return or panic
        let _cleanup_guard = CleanupGuard {
            map: &self.in_flight_requests,
            key: key_owned,
        };

        // Another request might have populated it while we were waiting
        if let Some(value) = self.get(key, &options).await {
            return Ok(value);
        }

        debug!(key = %key, "Computing fresh value (stampede protected)");
        let value = factory().await?;
        if !self.set(key, &value, ttl, &options).await {
            debug!(key = %key, "Computed value not cached");
        }
        Ok(value)
    }

    // ===== Introspection =====

    /// Snapshot of both tiers and the operation counters
    pub async fn stats(&self) -> CacheStats {
        let remote = if self.remote.is_available() {
            match self.remote.info(None).await {
                Ok(text) => RemoteInfo::from_info(&text),
                Err(err) => {
                    debug!(error = %err, "Remote INFO unavailable for stats");
                    RemoteInfo::default()
                }
            }
        } else {
            RemoteInfo::default()
        };

        CacheStats {
            backend: self.remote.backend_name(),
            availability: self.remote.availability(),
            remote,
            memory: (*self.governor.snapshot()).clone(),
            local: self.local.stats(),
            operations: self.metrics.snapshot(),
            top_namespaces: (*self.governor.top_namespaces()).clone(),
            in_flight_requests: self.in_flight_requests.len(),
        }
    }

    /// PING the remote tier
    ///
    /// Returns `true` when it answered. The local tier needs no check, so a
    /// `false` means the manager is running local-only.
    pub async fn health_check(&self) -> bool {
        match self.remote.ping().await {
            Ok(latency) => {
                debug!(latency_ms = latency.as_millis(), "Cache health check passed");
                true
            }
            Err(err) => {
                warn!(error = %err, "Cache health check failed, running local-only");
                false
            }
        }
    }

    /// Receive availability, memory and eviction notifications
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn remote(&self) -> &Arc<RemoteClient> {
        &self.remote
    }

    pub fn local(&self) -> &Arc<LocalCache> {
        &self.local
    }

    pub fn governor(&self) -> &Arc<MemoryGovernor> {
        &self.governor
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    // ===== Shutdown =====

    /// Stop every timer and pending reconnect, then drop the remote connection
    ///
    /// Idempotent. The local tier keeps serving until the manager is dropped.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.governor.stop();
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        self.remote.close();
        info!("Cache manager closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait for Ctrl-C, then [`close`](Self::close)
    pub async fn close_on_signal(&self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, closing cache"),
            Err(err) => warn!(error = %err, "Failed to listen for shutdown signal, closing cache"),
        }
        self.close();
    }
}
