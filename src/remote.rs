//! Remote Cache Client
//!
//! Owns the shared connection to the backing store and its health:
//! - availability flag, reconnect counter and last-checked timestamp
//! - a single in-flight reconnect loop with exponential backoff
//! - a periodic PING health check
//!
//! Every passthrough command observes its own result; connection-class
//! failures flip availability and schedule a reconnect without the caller
//! having to do anything.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backends::DegradedStore;
use crate::config::CacheConfig;
use crate::error::RemoteError;
use crate::events::{CacheEvent, EventBus};
use crate::metrics::CacheMetrics;
use crate::traits::{RemoteStore, StoreConnector};

/// Connection lifecycle signal fed into [`RemoteClient::handle_event`]
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A connection is established and answering
    Ready,
    Error(RemoteError),
    /// The connection was closed by the peer
    End,
}

/// Snapshot of the remote tier's availability
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AvailabilityState {
    pub available: bool,
    pub reconnect_attempts: u32,
    /// Unix milliseconds of the last health observation
    pub last_checked_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct ReconnectSettings {
    connect_retries: u32,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    health_check_interval: Duration,
}

impl From<&CacheConfig> for ReconnectSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            connect_retries: config.max_retries,
            max_attempts: config.max_reconnect_attempts,
            base_delay: config.reconnect_base_delay,
            max_delay: config.reconnect_max_delay,
            health_check_interval: config.health_check_interval,
        }
    }
}

pub struct RemoteClient {
    store: RwLock<Arc<dyn RemoteStore>>,
    connector: Arc<dyn StoreConnector>,
    settings: ReconnectSettings,
    available: AtomicBool,
    reconnect_attempts: AtomicU32,
    last_checked_ms: AtomicU64,
    reconnect_pending: AtomicBool,
    abandoned: AtomicBool,
    closed: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<CacheMetrics>,
    events: EventBus,
}

impl RemoteClient {
    /// Wrap an already-established store
    ///
    /// Availability starts optimistic (`available`).
    pub fn new(
        store: Arc<dyn RemoteStore>,
        connector: Arc<dyn StoreConnector>,
        config: &CacheConfig,
        metrics: Arc<CacheMetrics>,
        events: EventBus,
    ) -> Arc<Self> {
        let client = Arc::new(Self {
            store: RwLock::new(store),
            connector,
            settings: ReconnectSettings::from(config),
            available: AtomicBool::new(true),
            reconnect_attempts: AtomicU32::new(0),
            last_checked_ms: AtomicU64::new(unix_millis()),
            reconnect_pending: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            reconnect_task: Mutex::new(None),
            health_task: Mutex::new(None),
            metrics,
            events,
        });
        client.metrics.set_availability(true);
        client
    }

    /// Connect with retry/backoff; never fails
    ///
    /// When every attempt fails a [`DegradedStore`] is installed, the tier is
    /// marked unavailable and the reconnect loop takes over.
    pub async fn connect(
        config: &CacheConfig,
        connector: Arc<dyn StoreConnector>,
        metrics: Arc<CacheMetrics>,
        events: EventBus,
    ) -> Arc<Self> {
        let settings = ReconnectSettings::from(config);
        let endpoint = connector.endpoint();
        let mut last_error = RemoteError::Unavailable;

        for attempt in 0..=settings.connect_retries {
            if attempt > 0 {
                let delay = backoff_delay(attempt, settings.base_delay, settings.max_delay, true);
                debug!(attempt, delay_ms = delay.as_millis(), "Retrying remote cache connection");
                tokio::time::sleep(delay).await;
            }
            match connector.connect().await {
                Ok(store) => {
                    info!(endpoint = %endpoint, backend = store.name(), "Remote cache connected");
                    return Self::new(store, connector, config, metrics, events);
                }
                Err(err) => {
                    warn!(endpoint = %endpoint, attempt, error = %err, "Remote cache connection attempt failed");
                    last_error = err;
                }
            }
        }

        warn!(
            endpoint = %endpoint,
            error = %last_error,
            "Remote cache unreachable, continuing with degraded store"
        );
        let client = Self::new(Arc::new(DegradedStore), connector, config, metrics, events);
        client.mark_unavailable(&last_error);
        client.schedule_reconnect();
        client
    }

    /// Apply a connection lifecycle event
    pub fn handle_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Ready => {
                self.touch();
                self.reconnect_attempts.store(0, Ordering::Release);
                self.abandoned.store(false, Ordering::Release);
                self.metrics.set_reconnect_attempts(0);
                if !self.available.swap(true, Ordering::AcqRel) {
                    info!("Remote cache available");
                    self.metrics.set_availability(true);
                    self.events
                        .emit(CacheEvent::AvailabilityChanged { available: true });
                }
            }
            ConnectionEvent::Error(err) if err.is_connection_class() => {
                self.mark_unavailable(&err);
                self.schedule_reconnect();
            }
            ConnectionEvent::Error(err) => {
                debug!(error = %err, "Remote cache command error");
            }
            ConnectionEvent::End => {
                self.mark_unavailable(&RemoteError::Connection("connection ended".to_string()));
            }
        }
    }

    fn mark_unavailable(&self, cause: &RemoteError) {
        self.touch();
        if self.available.swap(false, Ordering::AcqRel) {
            warn!(error = %cause, "Remote cache unavailable");
            self.metrics.set_availability(false);
            self.events
                .emit(CacheEvent::AvailabilityChanged { available: false });
        }
    }

    /// Start the reconnect loop unless one is already running
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) || self.abandoned.load(Ordering::Acquire) {
            return;
        }
        if self
            .reconnect_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.reconnect_loop().await;
            this.finish_reconnect();
        });
        *self.reconnect_task.lock() = Some(handle);
    }

    /// Release the reconnect slot, starting a new loop if the tier dropped
    /// again while the last one was finishing
    fn finish_reconnect(self: &Arc<Self>) {
        self.reconnect_pending.store(false, Ordering::Release);
        if !self.available.load(Ordering::Acquire) {
            self.schedule_reconnect();
        }
    }

    async fn reconnect_loop(self: &Arc<Self>) {
        loop {
            if self.closed.load(Ordering::Acquire) || self.available.load(Ordering::Acquire) {
                return;
            }

            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::AcqRel) + 1;
            if attempt > self.settings.max_attempts {
                let attempts = self.settings.max_attempts;
                self.reconnect_attempts.store(attempts, Ordering::Release);
                self.abandoned.store(true, Ordering::Release);
                error!(attempts, "Giving up on remote cache reconnection");
                self.events.emit(CacheEvent::ReconnectAbandoned { attempts });
                return;
            }
            self.metrics.set_reconnect_attempts(attempt);

            let delay = backoff_delay(
                attempt,
                self.settings.base_delay,
                self.settings.max_delay,
                false,
            );
            debug!(attempt, delay_ms = delay.as_millis(), "Remote cache reconnect scheduled");
            tokio::time::sleep(delay).await;

            if self.closed.load(Ordering::Acquire) {
                return;
            }
            if self.try_recover().await {
                return;
            }
        }
    }

    async fn try_recover(self: &Arc<Self>) -> bool {
        if !self.refresh_store_if_degraded().await {
            return false;
        }
        let (result, _) = self.timed_ping().await;
        match result {
            Ok(()) => {
                self.handle_event(ConnectionEvent::Ready);
                true
            }
            Err(err) => {
                debug!(error = %err, "Remote cache still unreachable");
                false
            }
        }
    }

    /// Replace a degraded stub with a fresh connection; `false` if that failed
    async fn refresh_store_if_degraded(&self) -> bool {
        if !self.current_store().is_degraded() {
            return true;
        }
        match self.connector.connect().await {
            Ok(store) => {
                info!(backend = store.name(), "Remote cache connection re-established");
                *self.store.write() = store;
                true
            }
            Err(err) => {
                debug!(error = %err, "Remote cache connect attempt failed");
                self.touch();
                false
            }
        }
    }

    async fn timed_ping(&self) -> (Result<(), RemoteError>, Duration) {
        let store = self.current_store();
        let start = Instant::now();
        let result = store.ping().await;
        let latency = start.elapsed();
        self.metrics.record_ping(latency, result.is_ok());
        self.touch();
        (result, latency)
    }

    /// PING the store, updating availability either way
    ///
    /// # Errors
    ///
    /// Returns the ping failure; the tier is marked unavailable and a
    /// reconnect is scheduled.
    pub async fn ping(self: &Arc<Self>) -> Result<Duration, RemoteError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RemoteError::Unavailable);
        }
        if !self.refresh_store_if_degraded().await {
            self.mark_unavailable(&RemoteError::Unavailable);
            self.schedule_reconnect();
            return Err(RemoteError::Unavailable);
        }

        let (result, latency) = self.timed_ping().await;
        match result {
            Ok(()) => {
                debug!(latency_ms = latency.as_millis(), "Remote cache ping ok");
                self.handle_event(ConnectionEvent::Ready);
                Ok(latency)
            }
            Err(err) => {
                warn!(error = %err, latency_ms = latency.as_millis(), "Remote cache ping failed");
                self.mark_unavailable(&err);
                self.schedule_reconnect();
                Err(err)
            }
        }
    }

    /// Start the periodic health check; a zero interval disables it
    pub fn spawn_health_check(self: &Arc<Self>) {
        let interval = self.settings.health_check_interval;
        if interval.is_zero() {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(client) = weak.upgrade() else { break };
                if client.closed.load(Ordering::Acquire) {
                    break;
                }
                let _ = client.ping().await;
            }
        });
        *self.health_task.lock() = Some(handle);
    }

    // ===== Passthrough commands =====

    fn observe<T>(self: &Arc<Self>, result: Result<T, RemoteError>) -> Result<T, RemoteError> {
        if let Err(err) = &result {
            self.handle_event(ConnectionEvent::Error(err.clone()));
        }
        result
    }

    /// # Errors
    ///
    /// Returns the classified store error.
    pub async fn get(self: &Arc<Self>, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let result = self.current_store().get(key).await;
        self.observe(result)
    }

    /// # Errors
    ///
    /// Returns the classified store error.
    pub async fn set_ex(
        self: &Arc<Self>,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), RemoteError> {
        let result = self.current_store().set_ex(key, value, ttl).await;
        self.observe(result)
    }

    /// # Errors
    ///
    /// Returns the classified store error.
    pub async fn del(self: &Arc<Self>, key: &str) -> Result<u64, RemoteError> {
        let result = self.current_store().del(key).await;
        self.observe(result)
    }

    /// # Errors
    ///
    /// Returns the classified store error.
    pub async fn scan_match(
        self: &Arc<Self>,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), RemoteError> {
        let result = self.current_store().scan_match(cursor, pattern, count).await;
        self.observe(result)
    }

    /// # Errors
    ///
    /// Returns the classified store error.
    pub async fn pipeline_del(self: &Arc<Self>, keys: &[String]) -> Result<Vec<u64>, RemoteError> {
        let result = self.current_store().pipeline_del(keys).await;
        self.observe(result)
    }

    /// # Errors
    ///
    /// Returns the classified store error.
    pub async fn memory_usage(self: &Arc<Self>, key: &str) -> Result<Option<u64>, RemoteError> {
        let result = self.current_store().memory_usage(key).await;
        self.observe(result)
    }

    /// # Errors
    ///
    /// Returns the classified store error.
    pub async fn ttl(self: &Arc<Self>, key: &str) -> Result<i64, RemoteError> {
        let result = self.current_store().ttl(key).await;
        self.observe(result)
    }

    /// # Errors
    ///
    /// Returns the classified store error.
    pub async fn dbsize(self: &Arc<Self>) -> Result<u64, RemoteError> {
        let result = self.current_store().dbsize().await;
        self.observe(result)
    }

    /// # Errors
    ///
    /// Returns the classified store error.
    pub async fn info(self: &Arc<Self>, section: Option<&str>) -> Result<String, RemoteError> {
        let result = self.current_store().info(section).await;
        self.observe(result)
    }

    /// # Errors
    ///
    /// Returns the classified store error.
    pub async fn set_eviction_policy(self: &Arc<Self>, policy: &str) -> Result<(), RemoteError> {
        let result = self.current_store().set_eviction_policy(policy).await;
        self.observe(result)
    }

    // ===== State =====

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Acquire)
    }

    pub fn availability(&self) -> AvailabilityState {
        AvailabilityState {
            available: self.is_available(),
            reconnect_attempts: self.reconnect_attempts(),
            last_checked_ms: self.last_checked_ms.load(Ordering::Acquire),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.current_store().name()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn current_store(&self) -> Arc<dyn RemoteStore> {
        Arc::clone(&self.store.read())
    }

    fn touch(&self) {
        self.last_checked_ms.store(unix_millis(), Ordering::Release);
    }

    /// Stop the health check and any pending reconnect, then drop the connection
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.reconnect_task.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.health_task.lock().take() {
            handle.abort();
        }
        self.reconnect_pending.store(false, Ordering::Release);
        *self.store.write() = Arc::new(DegradedStore);
        if self.available.swap(false, Ordering::AcqRel) {
            self.metrics.set_availability(false);
            self.events
                .emit(CacheEvent::AvailabilityChanged { available: false });
        }
        info!("Remote cache client closed");
    }
}

/// Exponential backoff: `base * 2^(attempt-1)` capped at `max`, with up to
/// 10% added jitter when requested
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration, jitter: bool) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    let capped = base.saturating_mul(factor).min(max);
    if !jitter {
        return capped;
    }
    let spread = u64::try_from(capped.as_millis() / 10).unwrap_or(u64::MAX);
    if spread == 0 {
        return capped;
    }
    let extra = rand::thread_rng().gen_range(0..=spread);
    (capped + Duration::from_millis(extra)).min(max)
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Empty store that always answers PING
    struct HealthyStore;

    #[async_trait]
    impl RemoteStore for HealthyStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
            DegradedStore.get(key).await
        }

        async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), RemoteError> {
            DegradedStore.set_ex(key, value, ttl).await
        }

        async fn del(&self, key: &str) -> Result<u64, RemoteError> {
            DegradedStore.del(key).await
        }

        async fn scan_match(
            &self,
            cursor: u64,
            pattern: &str,
            count: usize,
        ) -> Result<(u64, Vec<String>), RemoteError> {
            DegradedStore.scan_match(cursor, pattern, count).await
        }

        async fn pipeline_del(&self, keys: &[String]) -> Result<Vec<u64>, RemoteError> {
            DegradedStore.pipeline_del(keys).await
        }

        async fn memory_usage(&self, key: &str) -> Result<Option<u64>, RemoteError> {
            DegradedStore.memory_usage(key).await
        }

        async fn ttl(&self, key: &str) -> Result<i64, RemoteError> {
            DegradedStore.ttl(key).await
        }

        async fn dbsize(&self) -> Result<u64, RemoteError> {
            Ok(0)
        }

        async fn info(&self, section: Option<&str>) -> Result<String, RemoteError> {
            DegradedStore.info(section).await
        }

        async fn ping(&self) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn set_eviction_policy(&self, _policy: &str) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_reconnect_restarts_when_tier_drops_while_finishing() {
        let config = CacheConfig {
            reconnect_base_delay: Duration::from_millis(1),
            reconnect_max_delay: Duration::from_millis(5),
            health_check_interval: Duration::ZERO,
            ..CacheConfig::default()
        };
        let client = RemoteClient::new(
            Arc::new(HealthyStore),
            Arc::new(crate::backends::DegradedConnector),
            &config,
            Arc::new(CacheMetrics::new()),
            EventBus::new(),
        );

        // a previous loop still holds the slot when the tier drops again
        client.reconnect_pending.store(true, Ordering::Release);
        client.handle_event(ConnectionEvent::Error(RemoteError::Connection(
            "connection reset".to_string(),
        )));
        assert!(!client.is_available());

        client.finish_reconnect();
        for _ in 0..200 {
            if client.is_available() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(client.is_available());
        assert_eq!(client.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_finish_reconnect_idle_when_available() {
        let client = RemoteClient::new(
            Arc::new(HealthyStore),
            Arc::new(crate::backends::DegradedConnector),
            &CacheConfig::default(),
            Arc::new(CacheMetrics::new()),
            EventBus::new(),
        );
        client.reconnect_pending.store(true, Ordering::Release);
        client.finish_reconnect();
        assert!(!client.reconnect_pending.load(Ordering::Acquire));
        assert!(client.reconnect_task.lock().is_none());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        assert_eq!(backoff_delay(1, base, max, false), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, base, max, false), Duration::from_millis(200));
        assert_eq!(backoff_delay(4, base, max, false), Duration::from_millis(800));
        assert_eq!(backoff_delay(5, base, max, false), max);
        assert_eq!(backoff_delay(40, base, max, false), max);
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(10);
        for _ in 0..50 {
            let d = backoff_delay(3, base, max, true);
            assert!(d >= Duration::from_millis(400));
            assert!(d <= Duration::from_millis(440));
        }
    }
}
