//! Entity-scoped cache access for repositories
//!
//! A repository holds an [`EntityCache`] for its entity and builds every key
//! through it, so invalidation can be expressed purely as key patterns.
//!
//! ```rust,no_run
//! use dual_tier_cache::{CacheManagerBuilder, EntityCache};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cache = CacheManagerBuilder::new().build().await?;
//! let pets = EntityCache::from_manager(cache, "pet");
//!
//! let key = pets.key("findByUser").param("userId", 42).build();
//! let found: Vec<String> = pets
//!     .remember(&key, Some(Duration::from_secs(300)), || async {
//!         Ok(vec!["p1".to_string()])
//!     })
//!     .await?;
//!
//! pets.invalidate_entity_cache("p1").await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::cache_manager::CacheManager;
use crate::key::{CacheKey, CacheKeyBuilder, encode_segment, escape_glob};
use crate::options::CacheOptions;

/// Cache handle scoped to `namespace:environment:entity`
#[derive(Clone)]
pub struct EntityCache {
    cache: CacheManager,
    namespace: String,
    environment: String,
    entity: String,
    scope: String,
}

impl EntityCache {
    pub fn new(
        cache: CacheManager,
        namespace: impl Into<String>,
        environment: impl Into<String>,
        entity: impl Into<String>,
    ) -> Self {
        let namespace = namespace.into();
        let environment = environment.into();
        let entity = entity.into();
        let scope = format!("{namespace}:{environment}:{entity}");
        Self {
            cache,
            namespace,
            environment,
            entity,
            scope,
        }
    }

    /// Scope using the manager's key prefix and environment
    pub fn from_manager(cache: CacheManager, entity: impl Into<String>) -> Self {
        let namespace = cache.config().key_prefix.clone();
        let environment = cache.config().environment.clone();
        Self::new(cache, namespace, environment, entity)
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    /// Key builder for one of this entity's query methods
    pub fn key(&self, method: impl Into<String>) -> CacheKeyBuilder {
        CacheKey::builder(
            self.namespace.as_str(),
            self.environment.as_str(),
            self.entity.as_str(),
            method,
        )
    }

    /// Cached query: read `key` or run `factory` and store its result
    ///
    /// # Errors
    ///
    /// Returns the factory's error.
    pub async fn remember<T, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Option<Duration>,
        factory: F,
    ) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.cache.get_or_set(key.as_str(), factory, ttl).await
    }

    /// Drop cached queries of this entity
    ///
    /// `pattern` is matched below the scope (`"findByUser:*"`); `None` drops
    /// everything in the scope.
    pub async fn invalidate_cache(&self, pattern: Option<&str>) -> u64 {
        let full = format!("{}:{}", self.scope, pattern.unwrap_or("*"));
        self.cache
            .del_by_pattern(&full, &CacheOptions::default())
            .await
    }

    /// Drop every cached query that carries `id=<id>` as a parameter
    pub async fn invalidate_entity_cache(&self, id: impl fmt::Display) -> u64 {
        let id = escape_glob(&encode_segment(&id.to_string()));
        let options = CacheOptions::default();
        let mut removed = 0;
        for pattern in [
            format!("{}:*:id={id}", self.scope),
            format!("{}:*:id={id}:*", self.scope),
        ] {
            removed += self.cache.del_by_pattern(&pattern, &options).await;
        }
        debug!(scope = %self.scope, id = %id, removed, "Entity cache invalidated");
        removed
    }
}
