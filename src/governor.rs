//! Memory Governor
//!
//! Samples memory and key statistics from both tiers on a timer, publishes
//! a fresh [`MemoryStats`] snapshot each tick, and evicts from the remote
//! tier when usage crosses the critical threshold.
//!
//! Snapshots are swapped whole; readers never see a half-updated sample.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backends::LocalCache;
use crate::config::{CacheConfig, EvictionPolicy};
use crate::events::{CacheEvent, EventBus};
use crate::key::namespace_prefix;
use crate::metrics::CacheMetrics;
use crate::remote::RemoteClient;

const SCAN_PAGE: usize = 100;
const CONCURRENT_LOOKUPS: usize = 16;
const TOP_NAMESPACES: usize = 10;

/// One memory sample across both tiers
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    pub used_bytes: u64,
    pub rss_bytes: u64,
    pub peak_bytes: u64,
    /// Budget the usage percentage is measured against; 0 when unknown
    pub max_bytes: u64,
    pub key_count: u64,
    pub avg_key_size: u64,
    pub fragmentation_ratio: f64,
    pub usage_pct: f64,
    pub limit_reached: bool,
    pub local_keys: u64,
    pub local_hits: u64,
    pub local_misses: u64,
    /// Unix milliseconds; 0 before the first sample
    pub sampled_at_ms: u64,
}

/// Memory attributed to one key namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceUsage {
    pub namespace: String,
    pub keys: u64,
    pub bytes: u64,
}

/// Releases the single-flight eviction flag
struct EvictingGuard<'a>(&'a AtomicBool);

impl Drop for EvictingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
struct GovernorSettings {
    memory_limit_bytes: Option<u64>,
    policy: EvictionPolicy,
    warning: f64,
    critical: f64,
    interval: Duration,
    eviction_max_keys: usize,
    eviction_sample_size: usize,
    scan_pattern: String,
    track_key_sizes: bool,
    key_size_sample: usize,
}

impl From<&CacheConfig> for GovernorSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            memory_limit_bytes: config.memory_limit_bytes(),
            policy: config.eviction_policy,
            warning: config.memory_warning_threshold,
            critical: config.memory_critical_threshold,
            interval: config.memory_check_interval,
            eviction_max_keys: config.eviction_max_keys,
            eviction_sample_size: config.eviction_sample_size,
            scan_pattern: if config.key_prefix.is_empty() {
                "*".to_string()
            } else {
                format!("{}:*", config.key_prefix)
            },
            track_key_sizes: config.track_key_sizes,
            key_size_sample: config.key_size_sample,
        }
    }
}

pub struct MemoryGovernor {
    remote: Arc<RemoteClient>,
    local: Arc<LocalCache>,
    metrics: Arc<CacheMetrics>,
    events: EventBus,
    settings: GovernorSettings,
    snapshot: RwLock<Arc<MemoryStats>>,
    key_sizes: RwLock<Arc<Vec<NamespaceUsage>>>,
    evicting: AtomicBool,
    policy_hinted: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryGovernor {
    pub fn new(
        config: &CacheConfig,
        remote: Arc<RemoteClient>,
        local: Arc<LocalCache>,
        metrics: Arc<CacheMetrics>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            local,
            metrics,
            events,
            settings: GovernorSettings::from(config),
            snapshot: RwLock::new(Arc::new(MemoryStats::default())),
            key_sizes: RwLock::new(Arc::new(Vec::new())),
            evicting: AtomicBool::new(false),
            policy_hinted: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    /// Latest published sample
    pub fn snapshot(&self) -> Arc<MemoryStats> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn usage_pct(&self) -> f64 {
        self.snapshot.read().usage_pct
    }

    pub fn warning_threshold(&self) -> f64 {
        self.settings.warning
    }

    pub fn critical_threshold(&self) -> f64 {
        self.settings.critical
    }

    /// Latest key-size distribution (empty unless sampled)
    pub fn top_namespaces(&self) -> Arc<Vec<NamespaceUsage>> {
        Arc::clone(&self.key_sizes.read())
    }

    /// Take a new sample, publish it, and react to the thresholds
    ///
    /// Remote fields carry over from the previous sample while the remote
    /// tier is unavailable.
    pub async fn sample(&self) -> Arc<MemoryStats> {
        let previous = self.snapshot();
        let local = self.local.stats();
        let mut next = MemoryStats {
            local_keys: local.entries,
            local_hits: local.hits,
            local_misses: local.misses,
            sampled_at_ms: unix_millis(),
            ..(*previous).clone()
        };
        let mut server_max = None;

        if self.remote.is_available() {
            match self.remote.info(Some("memory")).await {
                Ok(text) => {
                    let info = parse_info(&text);
                    next.used_bytes = info_u64(&info, "used_memory");
                    next.rss_bytes = info_u64(&info, "used_memory_rss");
                    next.peak_bytes = info_u64(&info, "used_memory_peak");
                    next.fragmentation_ratio = info
                        .get("mem_fragmentation_ratio")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0.0);
                    server_max = Some(info_u64(&info, "maxmemory"));
                }
                Err(err) => warn!(error = %err, "Failed to sample remote memory info"),
            }
            match self.remote.dbsize().await {
                Ok(count) => next.key_count = count,
                Err(err) => warn!(error = %err, "Failed to sample remote key count"),
            }
        }

        if let Some(limit) = self.settings.memory_limit_bytes {
            next.max_bytes = limit;
        } else if let Some(server_max) = server_max {
            next.max_bytes = server_max;
        }
        next.avg_key_size = next.used_bytes.checked_div(next.key_count).unwrap_or(0);
        next.usage_pct = usage_percent(next.used_bytes, next.max_bytes);
        next.limit_reached = next.max_bytes > 0 && next.used_bytes >= next.max_bytes;

        let next = Arc::new(next);
        *self.snapshot.write() = Arc::clone(&next);

        self.metrics
            .set_memory(next.used_bytes, next.usage_pct, next.key_count);
        self.metrics.set_local_entries(next.local_keys);
        debug!(
            used_bytes = next.used_bytes,
            usage_pct = next.usage_pct,
            keys = next.key_count,
            "Memory sample"
        );

        self.check_thresholds(&next).await;
        next
    }

    async fn check_thresholds(&self, stats: &MemoryStats) {
        let usage_pct = stats.usage_pct;
        if usage_pct >= self.settings.critical {
            warn!(usage_pct, threshold = self.settings.critical, "Remote cache memory critical");
            self.events.emit(CacheEvent::MemoryCritical { usage_pct });
            self.evict().await;
        } else if usage_pct >= self.settings.warning {
            warn!(usage_pct, threshold = self.settings.warning, "Remote cache memory warning");
            self.events.emit(CacheEvent::MemoryWarning { usage_pct });
        }
    }

    /// Evict before a write whose projected usage lands within 10 points of critical
    pub async fn evict_if_projected(&self, incoming_bytes: usize) {
        let stats = self.snapshot();
        if stats.max_bytes == 0 {
            return;
        }
        let projected = usage_percent(
            stats.used_bytes.saturating_add(incoming_bytes as u64),
            stats.max_bytes,
        );
        if projected >= self.settings.critical - 10.0 {
            debug!(projected, "Projected usage near critical, evicting proactively");
            self.evict().await;
        }
    }

    /// Run one eviction pass; concurrent calls return 0 immediately
    ///
    /// Returns the number of keys deleted from the remote tier.
    pub async fn evict(&self) -> usize {
        if self
            .evicting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Eviction already in progress");
            return 0;
        }
        // cleared on drop, so a cancelled caller cannot leave it set
        let _guard = EvictingGuard(&self.evicting);
        self.run_eviction().await
    }

    async fn run_eviction(&self) -> usize {
        if !self.remote.is_available() {
            return 0;
        }
        let policy = self.settings.policy;

        if let Some(server_policy) = policy.server_policy() {
            if !self.policy_hinted.swap(true, Ordering::AcqRel) {
                match self.remote.set_eviction_policy(server_policy).await {
                    Ok(()) => info!(policy = server_policy, "Remote eviction policy hinted"),
                    Err(err) => {
                        warn!(policy = server_policy, error = %err, "Failed to set remote eviction policy");
                        self.policy_hinted.store(false, Ordering::Release);
                    }
                }
            }
            return 0;
        }

        let stats = self.snapshot();
        let target = eviction_target(
            stats.key_count,
            stats.usage_pct,
            self.settings.warning,
            self.settings.eviction_max_keys,
        );
        if target == 0 {
            return 0;
        }

        let sample = self
            .sample_keys(self.settings.eviction_sample_size.max(target))
            .await;
        let victims = match policy {
            EvictionPolicy::Ttl => self.lowest_ttl_keys(sample, target).await,
            EvictionPolicy::Random => {
                let mut keys = sample;
                keys.shuffle(&mut rand::thread_rng());
                keys.truncate(target);
                keys
            }
            EvictionPolicy::Fifo | EvictionPolicy::Lru | EvictionPolicy::Lfu => {
                let mut keys = sample;
                keys.truncate(target);
                keys
            }
        };
        if victims.is_empty() {
            return 0;
        }

        let removed = match self.remote.pipeline_del(&victims).await {
            Ok(counts) => counts.iter().filter(|&&c| c > 0).count(),
            Err(err) => {
                warn!(error = %err, "Eviction delete failed");
                self.metrics.record_error("evict", err.kind());
                return 0;
            }
        };

        info!(policy = %policy, target, removed, "Evicted keys from remote cache");
        self.metrics.record_eviction(policy.as_str(), removed);
        self.events.emit(CacheEvent::Evicted {
            policy,
            keys: removed,
        });
        removed
    }

    /// Cursor-scan up to `limit` distinct keys under the configured prefix
    async fn sample_keys(&self, limit: usize) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            match self
                .remote
                .scan_match(cursor, &self.settings.scan_pattern, SCAN_PAGE)
                .await
            {
                Ok((next, page)) => {
                    for key in page {
                        if keys.len() >= limit {
                            break;
                        }
                        if seen.insert(key.clone()) {
                            keys.push(key);
                        }
                    }
                    cursor = next;
                }
                Err(err) => {
                    warn!(error = %err, "Key sampling scan failed");
                    break;
                }
            }
            if cursor == 0 || keys.len() >= limit {
                break;
            }
        }
        keys
    }

    async fn lowest_ttl_keys(&self, sample: Vec<String>, target: usize) -> Vec<String> {
        let mut with_ttl: Vec<(String, i64)> = futures_util::stream::iter(sample)
            .map(|key| async move {
                let ttl = self.remote.ttl(&key).await.unwrap_or(-2);
                (key, ttl)
            })
            .buffer_unordered(CONCURRENT_LOOKUPS)
            .collect()
            .await;

        // -2: already gone; -1: no expiry, evicted last
        with_ttl.retain(|(_, ttl)| *ttl != -2);
        with_ttl.sort_by_key(|(_, ttl)| if *ttl < 0 { i64::MAX } else { *ttl });
        with_ttl
            .into_iter()
            .take(target)
            .map(|(key, _)| key)
            .collect()
    }

    /// Sample key sizes and group them by namespace
    ///
    /// Informational only; never evicts.
    pub async fn sample_key_sizes(&self) -> Arc<Vec<NamespaceUsage>> {
        if !self.remote.is_available() {
            return self.top_namespaces();
        }
        let keys = self.sample_keys(self.settings.key_size_sample).await;
        let sizes: Vec<(String, u64)> = futures_util::stream::iter(keys)
            .map(|key| async move {
                let bytes = self
                    .remote
                    .memory_usage(&key)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or(0);
                (key, bytes)
            })
            .buffer_unordered(CONCURRENT_LOOKUPS)
            .collect()
            .await;

        let mut groups: HashMap<String, (u64, u64)> = HashMap::new();
        for (key, bytes) in sizes {
            let entry = groups.entry(namespace_prefix(&key).to_string()).or_default();
            entry.0 += 1;
            entry.1 += bytes;
        }
        let mut usage: Vec<NamespaceUsage> = groups
            .into_iter()
            .map(|(namespace, (keys, bytes))| NamespaceUsage {
                namespace,
                keys,
                bytes,
            })
            .collect();
        usage.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.namespace.cmp(&b.namespace)));
        usage.truncate(TOP_NAMESPACES);

        let usage = Arc::new(usage);
        *self.key_sizes.write() = Arc::clone(&usage);
        usage
    }

    /// Start the sampling loop; a zero interval disables it
    pub fn spawn(self: &Arc<Self>) {
        let interval = self.settings.interval;
        if interval.is_zero() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(governor) = weak.upgrade() else { break };
                if governor.remote.is_closed() {
                    break;
                }
                governor.sample().await;
                if governor.settings.track_key_sizes {
                    governor.sample_key_sizes().await;
                }
            }
        });
        *self.task.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

/// Keys to delete in one pass: `ceil(keys * (usage - warning) / 100)`, capped
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn eviction_target(key_count: u64, usage_pct: f64, warning_pct: f64, cap: usize) -> usize {
    if key_count == 0 || usage_pct <= warning_pct {
        return 0;
    }
    let raw = (key_count as f64 * (usage_pct - warning_pct) / 100.0).ceil();
    (raw as usize).min(cap)
}

#[allow(clippy::cast_precision_loss)]
fn usage_percent(used: u64, max: u64) -> f64 {
    if max == 0 {
        0.0
    } else {
        used as f64 / max as f64 * 100.0
    }
}

/// Parse `INFO` output into field/value pairs
pub fn parse_info(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn info_u64(info: &HashMap<String, String>, field: &str) -> u64 {
    info.get(field).and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
