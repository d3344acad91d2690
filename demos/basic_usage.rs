//! Basic usage of the dual-tier cache
//!
//! Run with: `cargo run --example basic_usage`
//!
//! Works with or without a Redis server on `REDIS_URL`; without one the
//! cache runs local-only and keeps trying to reconnect.

use std::time::Duration;

use dual_tier_cache::{CacheManagerBuilder, CacheOptions, EntityCache, Priority};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Pet {
    id: String,
    name: String,
}

async fn load_pets_for_user(user_id: u64) -> anyhow::Result<Vec<Pet>> {
    // stands in for a database query
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(vec![Pet {
        id: "p1".to_string(),
        name: format!("Rex (owner {user_id})"),
    }])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("=== Dual-Tier Cache: Basic Usage ===\n");

    let cache = CacheManagerBuilder::new().build().await?;
    let mut events = cache.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("event: {event:?}");
        }
    });

    let opts = CacheOptions::default();
    let key = "petpro:dev:pet:findByUser:userId=42";

    // 1. set + get
    cache
        .set(key, &serde_json::json!({"id": "p1"}), Some(Duration::from_secs(300)), &opts)
        .await;
    let cached: Option<serde_json::Value> = cache.get(key, &opts).await;
    println!("1. get after set: {cached:?}");

    // 2. repository-style access
    let pets = EntityCache::from_manager(cache.clone(), "pet");
    let by_user = pets.key("findByUser").param("userId", 7).build();
    for attempt in 1..=2 {
        let start = std::time::Instant::now();
        let found = pets
            .remember(&by_user, Some(Duration::from_secs(60)), || load_pets_for_user(7))
            .await?;
        println!(
            "2.{attempt} remember {} -> {} pet(s) in {:?}",
            by_user,
            found.len(),
            start.elapsed()
        );
    }

    // 3. low-priority, non-blocking write
    let background = CacheOptions::new().priority(Priority::Low).blocking(false);
    let stored = cache
        .set("petpro:dev:pet:list:page=1", &vec!["p1", "p2"], None, &background)
        .await;
    println!("3. low-priority write accepted: {stored}");

    // 4. invalidation
    let removed = pets.invalidate_cache(None).await;
    println!("4. invalidated {removed} key(s) in {}", pets.scope());

    // 5. stats
    let stats = cache.stats().await;
    println!("\n5. stats:\n{}", serde_json::to_string_pretty(&stats)?);

    cache.close();
    Ok(())
}
