//! Degraded Store - stand-in when no connection could be made
//!
//! Data commands behave like an empty store so callers see misses and
//! no-ops. PING fails, which keeps the remote tier marked unavailable until
//! a reconnect installs a live store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::traits::{RemoteStore, StoreConnector};

#[derive(Debug, Default, Clone, Copy)]
pub struct DegradedStore;

#[async_trait]
impl RemoteStore for DegradedStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        Ok(None)
    }

    async fn set_ex(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn del(&self, _key: &str) -> Result<u64, RemoteError> {
        Ok(0)
    }

    async fn scan_match(
        &self,
        _cursor: u64,
        _pattern: &str,
        _count: usize,
    ) -> Result<(u64, Vec<String>), RemoteError> {
        Ok((0, Vec::new()))
    }

    async fn pipeline_del(&self, keys: &[String]) -> Result<Vec<u64>, RemoteError> {
        Ok(vec![0; keys.len()])
    }

    async fn memory_usage(&self, _key: &str) -> Result<Option<u64>, RemoteError> {
        Ok(None)
    }

    async fn ttl(&self, _key: &str) -> Result<i64, RemoteError> {
        Ok(-2)
    }

    async fn dbsize(&self) -> Result<u64, RemoteError> {
        Ok(0)
    }

    async fn info(&self, _section: Option<&str>) -> Result<String, RemoteError> {
        Ok(String::new())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        Err(RemoteError::Unavailable)
    }

    async fn set_eviction_policy(&self, _policy: &str) -> Result<(), RemoteError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Degraded"
    }

    fn is_degraded(&self) -> bool {
        true
    }
}

/// Connector that never succeeds; used when no real backend is compiled in
#[derive(Debug, Default, Clone, Copy)]
pub struct DegradedConnector;

#[async_trait]
impl StoreConnector for DegradedConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteStore>, RemoteError> {
        Err(RemoteError::Unavailable)
    }

    fn endpoint(&self) -> String {
        "none".to_string()
    }
}
