//! Redis Store - Remote Backing Store
//!
//! Redis command surface over a `ConnectionManager`. Every command is
//! bounded by the configured command timeout so a stalled server surfaces as
//! a timeout-class error instead of hanging the caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::error::RemoteError;
use crate::traits::{RemoteStore, StoreConnector};

/// Redis backing store with `ConnectionManager` for transparent reconnection
pub struct RedisStore {
    conn_manager: ConnectionManager,
    command_timeout: Duration,
}

impl RedisStore {
    /// Connect and verify the connection with PING
    ///
    /// # Errors
    ///
    /// Returns a classified error if the URL is invalid, the connection
    /// cannot be established within `connect_timeout`, or PING fails.
    pub async fn connect(
        redis_url: &str,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = Client::open(redis_url)?;

        let conn_manager = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| RemoteError::Timeout(format!("connect to {}", redact(redis_url))))??;

        let store = Self {
            conn_manager,
            command_timeout,
        };
        store.ping().await?;

        info!(redis_url = %redact(redis_url), "Redis store connected (ConnectionManager enabled)");
        Ok(store)
    }

    async fn run<T, F>(&self, command: &'static str, fut: F) -> Result<T, RemoteError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result.map_err(RemoteError::from),
            Err(_) => Err(RemoteError::Timeout(command.to_string())),
        }
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let mut conn = self.conn_manager.clone();
        self.run("GET", async move { conn.get::<_, Option<Vec<u8>>>(key).await })
            .await
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), RemoteError> {
        let mut conn = self.conn_manager.clone();
        let secs = ttl.as_secs().max(1);
        self.run("SET", async move { conn.set_ex::<_, _, ()>(key, value, secs).await })
            .await?;
        debug!(key = %key, ttl_secs = secs, "[Redis] Cached key with TTL");
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<u64, RemoteError> {
        let mut conn = self.conn_manager.clone();
        self.run("DEL", async move { conn.del::<_, u64>(key).await }).await
    }

    async fn scan_match(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), RemoteError> {
        let mut conn = self.conn_manager.clone();
        self.run("SCAN", async move {
            redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn pipeline_del(&self, keys: &[String]) -> Result<Vec<u64>, RemoteError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn_manager.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("DEL").arg(key);
        }
        let removed = self
            .run("PIPELINE DEL", async move {
                pipe.query_async(&mut conn).await
            })
            .await?;
        debug!(count = keys.len(), "[Redis] Pipelined bulk delete");
        Ok(removed)
    }

    async fn memory_usage(&self, key: &str) -> Result<Option<u64>, RemoteError> {
        let mut conn = self.conn_manager.clone();
        self.run("MEMORY USAGE", async move {
            redis::cmd("MEMORY")
                .arg("USAGE")
                .arg(key)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn ttl(&self, key: &str) -> Result<i64, RemoteError> {
        let mut conn = self.conn_manager.clone();
        self.run("TTL", async move {
            redis::cmd("TTL").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn dbsize(&self) -> Result<u64, RemoteError> {
        let mut conn = self.conn_manager.clone();
        self.run("DBSIZE", async move {
            redis::cmd("DBSIZE").query_async(&mut conn).await
        })
        .await
    }

    async fn info(&self, section: Option<&str>) -> Result<String, RemoteError> {
        let mut conn = self.conn_manager.clone();
        self.run("INFO", async move {
            let mut cmd = redis::cmd("INFO");
            if let Some(section) = section {
                cmd.arg(section);
            }
            cmd.query_async(&mut conn).await
        })
        .await
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let mut conn = self.conn_manager.clone();
        self.run::<String, _>("PING", async move {
            redis::cmd("PING").query_async(&mut conn).await
        })
        .await?;
        Ok(())
    }

    async fn set_eviction_policy(&self, policy: &str) -> Result<(), RemoteError> {
        let mut conn = self.conn_manager.clone();
        self.run("CONFIG SET", async move {
            redis::cmd("CONFIG")
                .arg("SET")
                .arg("maxmemory-policy")
                .arg(policy)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}

/// Connector producing [`RedisStore`]s from a [`CacheConfig`]
#[derive(Debug, Clone)]
pub struct RedisConnector {
    redis_url: String,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl RedisConnector {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            redis_url: config.redis_url(),
            connect_timeout: config.connect_timeout,
            command_timeout: config.command_timeout,
        }
    }
}

#[async_trait]
impl StoreConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteStore>, RemoteError> {
        let store =
            RedisStore::connect(&self.redis_url, self.connect_timeout, self.command_timeout)
                .await?;
        Ok(Arc::new(store))
    }

    fn endpoint(&self) -> String {
        redact(&self.redis_url)
    }
}

/// Strip the password from a connection string before logging it
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", url.get(..scheme_end).unwrap_or(""), url.get(at..).unwrap_or(""))
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::redact;

    #[test]
    fn test_redact() {
        assert_eq!(redact("redis://:pw@host:6379/0"), "redis://***@host:6379/0");
        assert_eq!(redact("redis://host:6379"), "redis://host:6379");
    }
}
