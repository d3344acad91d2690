//! Cache Manager Builder
//!
//! Wires the tiers together and starts their background tasks.
//!
//! # Example: Using Defaults
//!
//! ```rust,no_run
//! use dual_tier_cache::CacheManagerBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // configuration from the environment, Redis connector
//!     let cache = CacheManagerBuilder::new().build().await?;
//!     cache.close();
//!     Ok(())
//! }
//! ```
//!
//! # Example: Custom Store
//!
//! ```rust,ignore
//! use dual_tier_cache::{CacheConfig, CacheManagerBuilder};
//! use std::sync::Arc;
//!
//! let cache = CacheManagerBuilder::new()
//!     .with_config(CacheConfig::default())
//!     .with_connector(Arc::new(MyConnector::new()))
//!     .build()
//!     .await?;
//! ```

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::backends::{LocalCache, LocalCacheConfig};
use crate::cache_manager::CacheManager;
use crate::config::CacheConfig;
use crate::events::EventBus;
use crate::governor::MemoryGovernor;
use crate::metrics::CacheMetrics;
use crate::remote::RemoteClient;
use crate::traits::StoreConnector;

/// Builder for [`CacheManager`]
///
/// # Default Behavior
///
/// - **Config**: [`CacheConfig::from_env`]
/// - **Connector**: `RedisConnector` (a connector that never succeeds when
///   the `redis` feature is off, leaving the manager local-only)
/// - **Background tasks**: health check, memory sampling and local sweep
///   all running
pub struct CacheManagerBuilder {
    config: Option<CacheConfig>,
    connector: Option<Arc<dyn StoreConnector>>,
    background_tasks: bool,
}

impl CacheManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            connector: None,
            background_tasks: true,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a custom backing store
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn StoreConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Disable the timers, e.g. to drive sampling by hand in tests
    ///
    /// Reconnection after a failed connect still runs.
    #[must_use]
    pub fn background_tasks(mut self, enabled: bool) -> Self {
        self.background_tasks = enabled;
        self
    }

    /// Connect and assemble the manager
    ///
    /// An unreachable backing store is not an error: the manager starts in
    /// local-only mode and keeps reconnecting.
    ///
    /// # Errors
    ///
    /// Returns an error only when the configuration is invalid.
    pub async fn build(self) -> Result<CacheManager> {
        let config = match self.config {
            Some(config) => {
                config.validate()?;
                config
            }
            None => CacheConfig::from_env()?,
        };
        let connector = self
            .connector
            .unwrap_or_else(|| default_connector(&config));

        info!(
            endpoint = %connector.endpoint(),
            key_prefix = %config.key_prefix,
            policy = %config.eviction_policy,
            "Initializing dual-tier cache"
        );

        let metrics = Arc::new(CacheMetrics::new());
        let events = EventBus::new();
        let local = Arc::new(LocalCache::new(LocalCacheConfig::from(&config)));
        let remote =
            RemoteClient::connect(&config, connector, Arc::clone(&metrics), events.clone()).await;
        let governor = MemoryGovernor::new(
            &config,
            Arc::clone(&remote),
            Arc::clone(&local),
            Arc::clone(&metrics),
            events.clone(),
        );

        let mut background = Vec::new();
        if self.background_tasks {
            remote.spawn_health_check();
            governor.spawn();
            background.push(local.spawn_sweeper(local.config().ttl));
        }

        info!(
            backend = remote.backend_name(),
            available = remote.is_available(),
            "Dual-tier cache ready"
        );

        Ok(CacheManager::from_parts(
            config, remote, local, governor, metrics, events, background,
        ))
    }
}

impl Default for CacheManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "redis")]
fn default_connector(config: &CacheConfig) -> Arc<dyn StoreConnector> {
    Arc::new(crate::backends::RedisConnector::new(config))
}

#[cfg(not(feature = "redis"))]
fn default_connector(_config: &CacheConfig) -> Arc<dyn StoreConnector> {
    Arc::new(crate::backends::DegradedConnector)
}
