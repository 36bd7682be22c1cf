//! Redis-backed store shared by every node.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use async_trait::async_trait;
use tracing::{debug, info};

use super::Store;
use crate::error::{Result, WardenError};

/// A [`Store`] backed by Redis.
///
/// Uses `SET NX EX` for `add` and `INCR` for `increment`, so concurrent nodes
/// see a single counter per key. Every command is bounded by `timeout`.
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: ConnectionManager,
    timeout: Duration,
}

impl RedisStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        info!(timeout_ms = timeout.as_millis() as u64, "Connecting to Redis store");

        let client = ::redis::Client::open(url)?;
        let connection_manager = bounded(timeout, ConnectionManager::new(client)).await?;

        Ok(Self {
            connection_manager,
            timeout,
        })
    }
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Run a Redis call, turning both errors and timeouts into `StoreUnavailable`.
async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = ::redis::RedisResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(WardenError::from),
        Err(_) => Err(WardenError::StoreUnavailable(format!(
            "redis call timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.connection_manager.clone();
        bounded(self.timeout, conn.get::<_, Option<i64>>(key)).await
    }

    async fn add(&self, key: &str, value: i64, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.connection_manager.clone();
        let reply: Option<String> = bounded(
            self.timeout,
            ::redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs.max(1))
                .query_async(&mut conn),
        )
        .await?;

        let added = reply.is_some();
        debug!(key = %key, added, "SET NX");
        Ok(added)
    }

    async fn put(&self, key: &str, value: i64, ttl_secs: u64) -> Result<()> {
        let mut conn = self.connection_manager.clone();
        bounded(self.timeout, conn.set_ex::<_, _, ()>(key, value, ttl_secs.max(1))).await
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection_manager.clone();
        bounded(self.timeout, conn.incr::<_, _, i64>(key, 1)).await
    }

    async fn forget(&self, key: &str) -> Result<()> {
        let mut conn = self.connection_manager.clone();
        bounded(self.timeout, conn.del::<_, ()>(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_maps_timeout_to_store_unavailable() {
        let never = std::future::pending::<::redis::RedisResult<i64>>();
        let err = bounded(Duration::from_millis(5), never).await.unwrap_err();
        assert!(err.is_store_unavailable());
    }

    #[tokio::test]
    async fn test_bounded_maps_redis_error() {
        let failing = async {
            Err::<i64, _>(::redis::RedisError::from((
                ::redis::ErrorKind::IoError,
                "connection refused",
            )))
        };
        let err = bounded(Duration::from_secs(1), failing).await.unwrap_err();
        assert!(err.is_store_unavailable());
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let result = RedisStore::connect("not a url", Duration::from_millis(50)).await;
        match result {
            Err(WardenError::StoreUnavailable(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connected with a malformed url"),
        }
    }
}
