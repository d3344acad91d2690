//! Dual-Tier Cache
//!
//! A resilient caching layer for Rust services featuring:
//! - **Remote tier**: Redis (or any [`RemoteStore`]) with availability
//!   tracking, health checks and single-flight reconnection
//! - **Local fallback tier**: bounded in-process Moka cache that keeps
//!   serving while the remote tier is down
//! - **Per-call policies**: priority gating, retries, fire-and-forget writes
//! - **Memory governor**: usage sampling, warning/critical events and
//!   policy-driven eviction
//! - **Pattern invalidation**: glob deletes across both tiers
//! - **Cache Stampede Protection**: DashMap + Mutex request coalescing
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use dual_tier_cache::{CacheManagerBuilder, CacheOptions};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheManagerBuilder::new().build().await?;
//!     let opts = CacheOptions::default();
//!
//!     let data = serde_json::json!({"id": "p1"});
//!     cache
//!         .set("petpro:dev:pet:findByUser:userId=42", &data, Some(Duration::from_secs(300)), &opts)
//!         .await;
//!
//!     if let Some(cached) = cache
//!         .get::<serde_json::Value>("petpro:dev:pet:findByUser:userId=42", &opts)
//!         .await
//!     {
//!         tracing::info!("Cached data: {}", cached);
//!     }
//!
//!     let removed = cache.del_by_pattern("petpro:dev:pet:*", &opts).await;
//!     tracing::info!(removed, "Invalidated");
//!
//!     cache.close();
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Request → Local Cache (Moka) → Remote Cache (Redis) → Miss
//!           ↓ Hit                ↓ Hit
//!           Return               Mirror to local, return
//!
//! Remote error → availability off → reconnect loop → available again
//! ```

pub mod backends;
pub mod builder;
pub mod cache_manager;
pub mod config;
pub mod error;
pub mod events;
pub mod governor;
pub mod key;
pub mod metrics;
pub mod options;
pub mod remote;
pub mod repository;
pub mod traits;

pub use backends::{DegradedConnector, DegradedStore, LocalCache, LocalCacheConfig, LocalCacheStats};
#[cfg(feature = "redis")]
pub use backends::{RedisConnector, RedisStore};
pub use builder::CacheManagerBuilder;
pub use cache_manager::{CacheManager, CacheStats, RemoteInfo};
pub use config::{CacheConfig, EvictionPolicy, LOCAL_TTL_CEILING};
pub use error::{ConfigError, RemoteError};
pub use events::{CacheEvent, EventBus};
pub use governor::{MemoryGovernor, MemoryStats, NamespaceUsage};
pub use key::{CacheKey, CacheKeyBuilder, GlobMatcher, KeyParts};
pub use metrics::{CacheMetrics, HitSource, OperationCounters};
pub use options::{CacheOptions, Priority};
pub use remote::{AvailabilityState, ConnectionEvent, RemoteClient};
pub use repository::EntityCache;
pub use traits::{RemoteStore, StoreConnector};

// Re-export async_trait for user convenience
pub use async_trait::async_trait;
