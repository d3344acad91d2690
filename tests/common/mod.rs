//! Common utilities for integration tests
//!
//! This module provides shared test infrastructure including:
//! - An in-memory `MockStore` with failure injection and call counters
//! - A `MockConnector` that can be switched between failing and succeeding
//! - Test data generators
//! - Cache setup helpers (no live Redis required)

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dual_tier_cache::{
    CacheConfig, CacheManager, CacheManagerBuilder, GlobMatcher, RemoteError, RemoteStore,
    StoreConnector, async_trait,
};
use parking_lot::Mutex;

/// How data commands of the [`MockStore`] fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    None,
    /// Non-connection command error; retried by the manager
    Command,
    /// Connection refused; flips availability
    Connection,
}

#[derive(Debug, Default)]
pub struct CallCounters {
    pub get: AtomicUsize,
    pub set: AtomicUsize,
    pub del: AtomicUsize,
    pub scan: AtomicUsize,
    pub pipeline_del: AtomicUsize,
    pub ping: AtomicUsize,
}

impl CallCounters {
    pub fn gets(&self) -> usize {
        self.get.load(Ordering::SeqCst)
    }

    pub fn sets(&self) -> usize {
        self.set.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
    /// Insertion order; doubles as the SCAN cursor
    seq: u64,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

/// In-memory stand-in for Redis
///
/// SCAN walks keys in insertion order; cursors stay valid while keys are
/// deleted between pages, as they do on a real server.
pub struct MockStore {
    data: Mutex<BTreeMap<String, Entry>>,
    next_seq: AtomicU64,
    failure: Mutex<FailureMode>,
    oom_writes: AtomicU32,
    ping_ok: AtomicBool,
    used_memory: AtomicU64,
    max_memory: AtomicU64,
    eviction_policy: Mutex<Option<String>>,
    scan_delay: Mutex<Option<Duration>>,
    pub calls: CallCounters,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(BTreeMap::new()),
            next_seq: AtomicU64::new(1),
            failure: Mutex::new(FailureMode::None),
            oom_writes: AtomicU32::new(0),
            ping_ok: AtomicBool::new(true),
            used_memory: AtomicU64::new(0),
            max_memory: AtomicU64::new(0),
            eviction_policy: Mutex::new(None),
            scan_delay: Mutex::new(None),
            calls: CallCounters::default(),
        })
    }

    pub fn set_failure(&self, mode: FailureMode) {
        *self.failure.lock() = mode;
    }

    /// Reject the next `n` writes with an out-of-memory error
    pub fn fail_next_writes_with_oom(&self, n: u32) {
        self.oom_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next SCAN page take `delay` to answer
    pub fn delay_next_scan(&self, delay: Duration) {
        *self.scan_delay.lock() = Some(delay);
    }

    pub fn set_ping_ok(&self, ok: bool) {
        self.ping_ok.store(ok, Ordering::SeqCst);
    }

    /// Values reported as `used_memory` / `maxmemory` by INFO
    pub fn set_memory(&self, used: u64, max: u64) {
        self.used_memory.store(used, Ordering::SeqCst);
        self.max_memory.store(max, Ordering::SeqCst);
    }

    pub fn insert_raw(&self, key: &str, value: &[u8], ttl: Option<Duration>) {
        let mut data = self.data.lock();
        let seq = match data.get(key) {
            Some(existing) if existing.is_live() => existing.seq,
            _ => self.next_seq.fetch_add(1, Ordering::SeqCst),
        };
        data.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
                seq,
            },
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.lock().get(key).is_some_and(Entry::is_live)
    }

    pub fn len(&self) -> usize {
        self.data.lock().values().filter(|e| e.is_live()).count()
    }

    /// Live keys in insertion order
    pub fn keys(&self) -> Vec<String> {
        let mut live: Vec<(u64, String)> = self
            .data
            .lock()
            .iter()
            .filter(|(_, e)| e.is_live())
            .map(|(k, e)| (e.seq, k.clone()))
            .collect();
        live.sort();
        live.into_iter().map(|(_, k)| k).collect()
    }

    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let data = self.data.lock();
        let entry = data.get(key)?;
        entry
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Simulate every entry reaching its expiry
    pub fn expire_all(&self) {
        self.data.lock().clear();
    }

    pub fn eviction_policy(&self) -> Option<String> {
        self.eviction_policy.lock().clone()
    }

    fn check(&self, command: &str) -> Result<(), RemoteError> {
        match *self.failure.lock() {
            FailureMode::None => Ok(()),
            FailureMode::Command => Err(RemoteError::Command(format!("{command} rejected"))),
            FailureMode::Connection => {
                Err(RemoteError::Connection("connection refused".to_string()))
            }
        }
    }

    fn remove(&self, key: &str) -> u64 {
        match self.data.lock().remove(key) {
            Some(entry) if entry.is_live() => 1,
            _ => 0,
        }
    }
}

#[async_trait]
impl RemoteStore for MockStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        self.calls.get.fetch_add(1, Ordering::SeqCst);
        self.check("GET")?;
        Ok(self
            .data
            .lock()
            .get(key)
            .filter(|e| e.is_live())
            .map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), RemoteError> {
        self.calls.set.fetch_add(1, Ordering::SeqCst);
        self.check("SET")?;
        if self
            .oom_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RemoteError::OutOfMemory(
                "command not allowed when used memory > 'maxmemory'".to_string(),
            ));
        }
        self.insert_raw(key, value, Some(ttl));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<u64, RemoteError> {
        self.calls.del.fetch_add(1, Ordering::SeqCst);
        self.check("DEL")?;
        Ok(self.remove(key))
    }

    async fn scan_match(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), RemoteError> {
        self.calls.scan.fetch_add(1, Ordering::SeqCst);
        let delay = self.scan_delay.lock().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check("SCAN")?;
        let matcher =
            GlobMatcher::new(pattern).map_err(|e| RemoteError::Command(e.to_string()))?;
        let mut remaining: Vec<(u64, String)> = self
            .data
            .lock()
            .iter()
            .filter(|(k, e)| e.is_live() && e.seq >= cursor && matcher.is_match(k))
            .map(|(k, e)| (e.seq, k.clone()))
            .collect();
        remaining.sort();

        let more = remaining.len() > count;
        remaining.truncate(count);
        let next = match remaining.last() {
            Some((seq, _)) if more => seq + 1,
            _ => 0,
        };
        Ok((next, remaining.into_iter().map(|(_, k)| k).collect()))
    }

    async fn pipeline_del(&self, keys: &[String]) -> Result<Vec<u64>, RemoteError> {
        self.calls.pipeline_del.fetch_add(1, Ordering::SeqCst);
        self.check("PIPELINE")?;
        Ok(keys.iter().map(|k| self.remove(k)).collect())
    }

    async fn memory_usage(&self, key: &str) -> Result<Option<u64>, RemoteError> {
        self.check("MEMORY")?;
        Ok(self
            .data
            .lock()
            .get(key)
            .filter(|e| e.is_live())
            .map(|e| (e.value.len() + key.len()) as u64))
    }

    async fn ttl(&self, key: &str) -> Result<i64, RemoteError> {
        self.check("TTL")?;
        let data = self.data.lock();
        Ok(match data.get(key) {
            Some(entry) if entry.is_live() => match entry.expires_at {
                Some(at) => i64::try_from(at.saturating_duration_since(Instant::now()).as_secs())
                    .unwrap_or(i64::MAX),
                None => -1,
            },
            _ => -2,
        })
    }

    async fn dbsize(&self) -> Result<u64, RemoteError> {
        self.check("DBSIZE")?;
        Ok(self.len() as u64)
    }

    async fn info(&self, _section: Option<&str>) -> Result<String, RemoteError> {
        self.check("INFO")?;
        let used = self.used_memory.load(Ordering::SeqCst);
        let max = self.max_memory.load(Ordering::SeqCst);
        Ok(format!(
            "# Server\r\nredis_version:7.2.0-mock\r\nuptime_in_seconds:42\r\n\
             # Clients\r\nconnected_clients:1\r\n\
             # Memory\r\nused_memory:{used}\r\nused_memory_rss:{used}\r\n\
             used_memory_peak:{used}\r\nmaxmemory:{max}\r\nmem_fragmentation_ratio:1.00\r\n\
             # Stats\r\ntotal_commands_processed:7\r\nkeyspace_hits:3\r\nkeyspace_misses:1\r\n"
        ))
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.calls.ping.fetch_add(1, Ordering::SeqCst);
        if *self.failure.lock() == FailureMode::Connection {
            return Err(RemoteError::Connection("connection refused".to_string()));
        }
        if self.ping_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Timeout("PING".to_string()))
        }
    }

    async fn set_eviction_policy(&self, policy: &str) -> Result<(), RemoteError> {
        self.check("CONFIG")?;
        *self.eviction_policy.lock() = Some(policy.to_string());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Mock"
    }
}

/// Hands out the shared [`MockStore`] once `succeed` is on
pub struct MockConnector {
    store: Arc<MockStore>,
    succeed: AtomicBool,
    pub attempts: AtomicUsize,
}

impl MockConnector {
    pub fn new(store: Arc<MockStore>, succeed: bool) -> Arc<Self> {
        Arc::new(Self {
            store,
            succeed: AtomicBool::new(succeed),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn set_succeed(&self, succeed: bool) {
        self.succeed.store(succeed, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreConnector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteStore>, RemoteError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.succeed.load(Ordering::SeqCst) {
            Ok(self.store.clone() as Arc<dyn RemoteStore>)
        } else {
            Err(RemoteError::Connection("connection refused".to_string()))
        }
    }

    fn endpoint(&self) -> String {
        "mock://test".to_string()
    }
}

/// Fast retry/backoff timings, no timers
pub fn test_config() -> CacheConfig {
    CacheConfig {
        key_prefix: "petpro".to_string(),
        environment: "dev".to_string(),
        max_retries: 2,
        retry_delay: Duration::from_millis(1),
        max_retry_delay: Duration::from_millis(5),
        health_check_interval: Duration::ZERO,
        max_reconnect_attempts: 3,
        reconnect_base_delay: Duration::from_millis(10),
        reconnect_max_delay: Duration::from_millis(50),
        memory_check_interval: Duration::ZERO,
        ..CacheConfig::default()
    }
}

pub struct TestCache {
    pub cache: CacheManager,
    pub store: Arc<MockStore>,
    pub connector: Arc<MockConnector>,
}

/// Build a manager over a reachable mock store
pub async fn setup_cache() -> TestCache {
    setup_cache_with(test_config()).await
}

pub async fn setup_cache_with(config: CacheConfig) -> TestCache {
    setup(config, true).await
}

/// Build a manager whose connector never succeeds until told to
pub async fn setup_unreachable_cache(config: CacheConfig) -> TestCache {
    setup(config, false).await
}

async fn setup(config: CacheConfig, reachable: bool) -> TestCache {
    let store = MockStore::new();
    let connector = MockConnector::new(Arc::clone(&store), reachable);
    let cache = CacheManagerBuilder::new()
        .with_config(config)
        .with_connector(connector.clone() as Arc<dyn StoreConnector>)
        .background_tasks(false)
        .build()
        .await
        .expect("Failed to build cache");
    TestCache {
        cache,
        store,
        connector,
    }
}

/// Create a test key with a unique suffix under the test scope
pub fn test_key(name: &str) -> String {
    format!("petpro:dev:test:{}:n={}", name, rand::random::<u32>())
}

/// Generate test data of various types
pub mod test_data {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct Pet {
        pub id: String,
        pub name: String,
        pub owner_id: u64,
    }

    impl Pet {
        pub fn new(id: u64) -> Self {
            Self {
                id: format!("p{id}"),
                name: format!("Pet {id}"),
                owner_id: id % 7,
            }
        }
    }

    pub fn json_pet(id: u64) -> serde_json::Value {
        serde_json::json!({
            "id": format!("p{id}"),
            "name": format!("Pet {id}"),
            "species": "cat"
        })
    }

    /// JSON value whose serialized form is a little over `bytes` long
    pub fn json_data_sized(bytes: usize) -> serde_json::Value {
        serde_json::json!({ "data": "x".repeat(bytes) })
    }
}

/// Poll `check` every few milliseconds until it holds or `timeout` elapses
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
