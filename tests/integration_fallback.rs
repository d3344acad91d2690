//! Fallback, retry and priority-gating behavior when the remote tier misbehaves

mod common;

use std::time::Duration;

use common::*;
use dual_tier_cache::{CacheOptions, Priority};
use serde_json::json;

/// With the remote tier always failing, reads are served from the local tier
#[tokio::test]
async fn test_local_fallback_with_failing_remote() {
    let t = setup_cache().await;
    t.store.set_failure(FailureMode::Connection);
    let opts = CacheOptions::default();
    let key = test_key("fallback");
    let value = test_data::Pet::new(5);

    assert!(t.cache.set(&key, &value, None, &opts).await);
    assert!(!t.cache.remote().is_available());

    let cached: Option<test_data::Pet> = t.cache.get(&key, &opts).await;
    assert_eq!(cached, Some(value));
}

/// A connection error ends the write at once instead of retrying
#[tokio::test]
async fn test_connection_error_is_not_retried() {
    let t = setup_cache().await;
    t.store.set_failure(FailureMode::Connection);

    let opts = CacheOptions::new().max_retries(5);
    t.cache.set(&test_key("conn"), &json!(1), None, &opts).await;

    assert_eq!(t.store.calls.sets(), 1);
}

#[tokio::test]
async fn test_retry_bound() {
    let t = setup_cache().await;
    t.store.set_failure(FailureMode::Command);
    let key = test_key("retry");

    let opts = CacheOptions::new()
        .max_retries(2)
        .retry_delay(Duration::from_millis(1));
    // local tier still accepts the value
    assert!(t.cache.set(&key, &json!({"v": 1}), None, &opts).await);

    assert_eq!(t.store.calls.sets(), 3);
    assert!(t.cache.remote().is_available());
}

#[tokio::test]
async fn test_retry_disabled() {
    let t = setup_cache().await;
    t.store.set_failure(FailureMode::Command);

    let opts = CacheOptions::new().retry(false).max_retries(4);
    t.cache.set(&test_key("no_retry"), &json!(1), None, &opts).await;

    assert_eq!(t.store.calls.sets(), 1);
}

/// An out-of-memory reply triggers an eviction pass, then the write is retried
#[tokio::test]
async fn test_memory_error_evicts_and_retries() {
    let t = setup_cache().await;
    t.store.fail_next_writes_with_oom(1);
    let key = test_key("oom");

    assert!(t.cache.set(&key, &json!("v"), None, &CacheOptions::default()).await);

    assert_eq!(t.store.calls.sets(), 2);
    assert!(t.store.contains(&key));
    // default LRU policy hints the server instead of picking keys
    assert_eq!(t.store.eviction_policy().as_deref(), Some("allkeys-lru"));
}

/// At 96% usage against a 95% critical threshold, low-priority reads skip the remote tier
#[tokio::test]
async fn test_priority_gating_on_get() {
    let t = setup_cache().await;
    let key = "petpro:dev:pet:findById:id=1";
    t.store.insert_raw(key, br#"{"id":"p1"}"#, Some(Duration::from_secs(60)));
    t.store.set_memory(96, 100);
    let stats = t.cache.governor().sample().await;
    assert!(stats.usage_pct >= 95.0);

    let low = CacheOptions::new().priority(Priority::Low);
    let cached: Option<serde_json::Value> = t.cache.get(key, &low).await;
    assert!(cached.is_none());
    assert_eq!(t.store.calls.gets(), 0);

    let high = CacheOptions::new().priority(Priority::High);
    let cached: Option<serde_json::Value> = t.cache.get(key, &high).await;
    assert_eq!(cached, Some(json!({"id": "p1"})));
    assert_eq!(t.store.calls.gets(), 1);

    assert_eq!(t.cache.stats().await.operations.skipped, 1);
}

/// Writes gate at the softer warning threshold
#[tokio::test]
async fn test_priority_gating_on_set() {
    let t = setup_cache().await;
    t.store.set_memory(85, 100);
    t.cache.governor().sample().await;

    let low = CacheOptions::new().priority(Priority::Low);
    let key = test_key("gated");
    assert!(!t.cache.set(&key, &json!(1), None, &low).await);
    assert_eq!(t.store.calls.sets(), 0);
    assert!(t.cache.local().get(&key).is_none());

    // reads are not gated below critical
    let cached: Option<serde_json::Value> = t.cache.get(&key, &low).await;
    assert!(cached.is_none());
    assert_eq!(t.store.calls.gets(), 1);

    let medium = CacheOptions::new().priority(Priority::Medium);
    assert!(t.cache.set(&key, &json!(1), None, &medium).await);
}

/// An unreachable store at startup leaves a working local-only cache
#[tokio::test]
async fn test_degraded_connect() {
    let mut config = test_config();
    config.max_retries = 1;
    config.max_reconnect_attempts = 1;
    let t = setup_unreachable_cache(config).await;
    let opts = CacheOptions::default();

    assert!(!t.cache.remote().is_available());
    assert_eq!(t.cache.remote().backend_name(), "Degraded");
    assert!(!t.cache.health_check().await);

    let key = test_key("degraded");
    assert!(t.cache.set(&key, &json!({"ok": true}), None, &opts).await);
    let cached: Option<serde_json::Value> = t.cache.get(&key, &opts).await;
    assert_eq!(cached, Some(json!({"ok": true})));

    assert_eq!(t.cache.del_by_pattern("petpro:dev:test:*", &opts).await, 1);
    assert_eq!(t.store.calls.sets(), 0);
}

/// Non-blocking writes return before the remote round-trip completes
#[tokio::test]
async fn test_fire_and_forget_write() {
    let t = setup_cache().await;
    let key = test_key("detached");

    let opts = CacheOptions::new().blocking(false);
    assert!(t.cache.set(&key, &json!("later"), None, &opts).await);

    let store = t.store.clone();
    let probe = key.clone();
    assert!(eventually(Duration::from_secs(1), move || store.contains(&probe)).await);
}

/// High priority always awaits the remote write even when non-blocking is requested
#[tokio::test]
async fn test_high_priority_ignores_non_blocking() {
    let t = setup_cache().await;
    let key = test_key("high");

    let opts = CacheOptions::new().blocking(false).priority(Priority::High);
    assert!(t.cache.set(&key, &json!(1), None, &opts).await);
    assert!(t.store.contains(&key));
}

#[tokio::test]
async fn test_malformed_remote_payload_is_miss() {
    let t = setup_cache().await;
    let key = test_key("malformed");
    t.store.insert_raw(&key, b"not json", Some(Duration::from_secs(60)));

    let cached: Option<serde_json::Value> = t.cache.get(&key, &CacheOptions::default()).await;
    assert!(cached.is_none());
    assert!(t.cache.local().get(&key).is_none());

    let stats = t.cache.stats().await;
    assert_eq!(stats.operations.misses, 1);
    assert!(stats.operations.errors >= 1);
}
