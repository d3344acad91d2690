//! Cache Backend Implementations
//!
//! # Available Backends
//!
//! ## Local Tier
//! - **Moka** - bounded in-process fallback cache ([`LocalCache`])
//!
//! ## Remote Tier
//! - **Redis** - default backing store (feature: `redis`)
//! - **Degraded** - stand-in installed while no connection can be made
//!
//! # Usage
//!
//! ```rust,no_run
//! use dual_tier_cache::backends::{LocalCache, LocalCacheConfig, RedisStore};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let local = LocalCache::new(LocalCacheConfig::default());
//! let redis = RedisStore::connect(
//!     "redis://127.0.0.1:6379",
//!     Duration::from_secs(5),
//!     Duration::from_secs(2),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod degraded;
pub mod local_cache;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use degraded::{DegradedConnector, DegradedStore};
pub use local_cache::{LocalCache, LocalCacheConfig, LocalCacheStats};

#[cfg(feature = "redis")]
pub use redis_store::{RedisConnector, RedisStore};
