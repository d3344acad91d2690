//! Backend Traits
//!
//! The remote tier is reached through [`RemoteStore`], a thin command
//! surface over a Redis-like backing store. [`StoreConnector`] produces
//! stores and is called again on every reconnect attempt, which is how a
//! degraded stub gets replaced by a live connection.
//!
//! # Example: Custom Store
//!
//! ```rust,ignore
//! use dual_tier_cache::{RemoteError, RemoteStore, async_trait};
//! use std::time::Duration;
//!
//! struct MyStore { /* connection handle */ }
//!
//! #[async_trait]
//! impl RemoteStore for MyStore {
//!     async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
//!         // Your implementation
//!     }
//!
//!     // ... remaining commands
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::RemoteError;

/// Command surface of the backing store
///
/// Implementations must be `Send + Sync`; one instance is shared by every
/// caller of the cache manager.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// GET; `Ok(None)` when the key does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError>;

    /// SET with an expiry
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), RemoteError>;

    /// DEL; returns the number of keys removed
    async fn del(&self, key: &str) -> Result<u64, RemoteError>;

    /// One `SCAN cursor MATCH pattern COUNT count` page
    ///
    /// Returns the next cursor (0 when iteration is complete) and the page's keys.
    async fn scan_match(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), RemoteError>;

    /// Pipelined DEL of many keys; returns one removed-count per key, in order
    async fn pipeline_del(&self, keys: &[String]) -> Result<Vec<u64>, RemoteError>;

    /// `MEMORY USAGE key`; `Ok(None)` when the key does not exist
    async fn memory_usage(&self, key: &str) -> Result<Option<u64>, RemoteError>;

    /// Remaining TTL in seconds: -1 for no expiry, -2 for a missing key
    async fn ttl(&self, key: &str) -> Result<i64, RemoteError>;

    /// DBSIZE
    async fn dbsize(&self) -> Result<u64, RemoteError>;

    /// Raw INFO text, optionally for one section
    async fn info(&self, section: Option<&str>) -> Result<String, RemoteError>;

    async fn ping(&self) -> Result<(), RemoteError>;

    /// `CONFIG SET maxmemory-policy <policy>`
    async fn set_eviction_policy(&self, policy: &str) -> Result<(), RemoteError>;

    /// Name used in logs and stats
    fn name(&self) -> &'static str {
        "unknown"
    }

    /// Whether this store is a stand-in for a missing connection
    fn is_degraded(&self) -> bool {
        false
    }
}

/// Factory for [`RemoteStore`] connections
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Establish one connection attempt
    ///
    /// # Errors
    ///
    /// Returns the classified failure of this attempt; retry and backoff are
    /// applied by the caller.
    async fn connect(&self) -> Result<Arc<dyn RemoteStore>, RemoteError>;

    /// Endpoint description for logs
    fn endpoint(&self) -> String {
        "unknown".to_string()
    }
}
