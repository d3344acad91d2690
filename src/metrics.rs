//! Metrics Sink
//!
//! Every cache decision is counted twice: in local atomics that back
//! `CacheManager::stats()`, and through the `metrics` facade so whatever
//! recorder the host process installs (Prometheus, statsd, ...) sees it.
//! Without an installed recorder the facade calls are no-ops.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use serde::Serialize;

use crate::key::KeyParts;

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_ERRORS_TOTAL: &str = "cache_errors_total";
    pub const CACHE_SKIPPED_TOTAL: &str = "cache_skipped_total";
    pub const CACHE_OVERSIZED_TOTAL: &str = "cache_oversized_total";
    pub const CACHE_SETS_TOTAL: &str = "cache_sets_total";
    pub const CACHE_DELETES_TOTAL: &str = "cache_deletes_total";
    pub const CACHE_INVALIDATIONS_TOTAL: &str = "cache_invalidations_total";
    pub const CACHE_INVALIDATED_KEYS: &str = "cache_invalidated_keys";
    pub const CACHE_EVICTED_KEYS_TOTAL: &str = "cache_evicted_keys_total";
    pub const CACHE_OPERATION_DURATION_SECONDS: &str = "cache_operation_duration_seconds";
    pub const CACHE_PING_DURATION_SECONDS: &str = "cache_ping_duration_seconds";
    pub const CACHE_REMOTE_AVAILABLE: &str = "cache_remote_available";
    pub const CACHE_RECONNECT_ATTEMPTS: &str = "cache_reconnect_attempts";
    pub const CACHE_MEMORY_USAGE_PERCENT: &str = "cache_memory_usage_percent";
    pub const CACHE_MEMORY_USED_BYTES: &str = "cache_memory_used_bytes";
    pub const CACHE_REMOTE_KEYS: &str = "cache_remote_keys";
    pub const CACHE_LOCAL_ENTRIES: &str = "cache_local_entries";
}

/// Which tier answered a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSource {
    Local,
    Remote,
}

impl HitSource {
    fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// Counters exposed through `stats()`
#[derive(Debug, Clone, Default, Serialize)]
pub struct OperationCounters {
    pub local_hits: u64,
    pub remote_hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub skipped: u64,
    pub oversized: u64,
    pub sets: u64,
    pub deletes: u64,
    pub invalidations: u64,
    pub invalidated_keys: u64,
    pub evicted_keys: u64,
    pub pings: u64,
    pub ping_failures: u64,
    /// Percentage of reads answered by either tier
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
pub struct CacheMetrics {
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    skipped: AtomicU64,
    oversized: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    invalidations: AtomicU64,
    invalidated_keys: AtomicU64,
    evicted_keys: AtomicU64,
    pings: AtomicU64,
    ping_failures: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, source: HitSource, key: &str) {
        match source {
            HitSource::Local => self.local_hits.fetch_add(1, Ordering::Relaxed),
            HitSource::Remote => self.remote_hits.fetch_add(1, Ordering::Relaxed),
        };
        let parts = KeyParts::parse(key);
        counter!(
            names::CACHE_HITS_TOTAL,
            "source" => source.as_str(),
            "namespace" => parts.namespace.to_string()
        )
        .increment(1);
    }

    pub fn record_miss(&self, key: &str) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        let parts = KeyParts::parse(key);
        counter!(names::CACHE_MISSES_TOTAL, "namespace" => parts.namespace.to_string())
            .increment(1);
    }

    pub fn record_error(&self, operation: &'static str, kind: &'static str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_ERRORS_TOTAL, "operation" => operation, "kind" => kind).increment(1);
    }

    /// A call shed before reaching the remote tier
    pub fn record_skip(&self, operation: &'static str, reason: &'static str) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_SKIPPED_TOTAL, "operation" => operation, "reason" => reason)
            .increment(1);
    }

    pub fn record_oversized(&self, bytes: usize) {
        self.oversized.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_OVERSIZED_TOTAL).increment(1);
        tracing::debug!(bytes, "oversized cache item rejected");
    }

    pub fn record_set(&self, tier: &'static str) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_SETS_TOTAL, "tier" => tier).increment(1);
    }

    pub fn record_delete(&self, removed: u64) {
        self.deletes.fetch_add(removed, Ordering::Relaxed);
        counter!(names::CACHE_DELETES_TOTAL).increment(removed);
    }

    /// Distinguishes patterns that matched nothing from ones that matched keys
    pub fn record_invalidation(&self, pattern: &str, removed: u64) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        self.invalidated_keys.fetch_add(removed, Ordering::Relaxed);
        let result = if removed == 0 { "empty" } else { "matched" };
        let namespace = KeyParts::parse(pattern).namespace.to_string();
        counter!(
            names::CACHE_INVALIDATIONS_TOTAL,
            "result" => result,
            "namespace" => namespace.clone()
        )
        .increment(1);
        #[allow(clippy::cast_precision_loss)]
        histogram!(names::CACHE_INVALIDATED_KEYS, "namespace" => namespace).record(removed as f64);
    }

    pub fn record_eviction(&self, policy: &'static str, keys: usize) {
        self.evicted_keys.fetch_add(keys as u64, Ordering::Relaxed);
        counter!(names::CACHE_EVICTED_KEYS_TOTAL, "policy" => policy).increment(keys as u64);
    }

    pub fn record_ping(&self, latency: Duration, ok: bool) {
        self.pings.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.ping_failures.fetch_add(1, Ordering::Relaxed);
        }
        let outcome = if ok { "ok" } else { "failed" };
        histogram!(names::CACHE_PING_DURATION_SECONDS, "outcome" => outcome)
            .record(latency.as_secs_f64());
    }

    pub fn set_availability(&self, available: bool) {
        gauge!(names::CACHE_REMOTE_AVAILABLE).set(if available { 1.0 } else { 0.0 });
    }

    pub fn set_reconnect_attempts(&self, attempts: u32) {
        gauge!(names::CACHE_RECONNECT_ATTEMPTS).set(f64::from(attempts));
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn set_memory(&self, used_bytes: u64, usage_pct: f64, key_count: u64) {
        gauge!(names::CACHE_MEMORY_USED_BYTES).set(used_bytes as f64);
        gauge!(names::CACHE_MEMORY_USAGE_PERCENT).set(usage_pct);
        gauge!(names::CACHE_REMOTE_KEYS).set(key_count as f64);
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn set_local_entries(&self, entries: u64) {
        gauge!(names::CACHE_LOCAL_ENTRIES).set(entries as f64);
    }

    /// Run `fut`, recording its duration labelled by operation and key labels
    pub async fn timed<F>(&self, operation: &'static str, key: &str, fut: F) -> F::Output
    where
        F: Future,
    {
        let start = Instant::now();
        let output = fut.await;
        let parts = KeyParts::parse(key);
        histogram!(
            names::CACHE_OPERATION_DURATION_SECONDS,
            "operation" => operation,
            "namespace" => parts.namespace.to_string(),
            "method" => parts.method.to_string()
        )
        .record(start.elapsed().as_secs_f64());
        output
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> OperationCounters {
        let local_hits = self.local_hits.load(Ordering::Relaxed);
        let remote_hits = self.remote_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let reads = local_hits + remote_hits + misses;

        OperationCounters {
            local_hits,
            remote_hits,
            misses,
            errors: self.errors.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            oversized: self.oversized.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            invalidated_keys: self.invalidated_keys.load(Ordering::Relaxed),
            evicted_keys: self.evicted_keys.load(Ordering::Relaxed),
            pings: self.pings.load(Ordering::Relaxed),
            ping_failures: self.ping_failures.load(Ordering::Relaxed),
            hit_rate: if reads > 0 {
                ((local_hits + remote_hits) as f64 / reads as f64) * 100.0
            } else {
                0.0
            },
        }
    }
}
