//! Shared key-value stores holding attempt counters and window timers.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;

use crate::error::Result;

/// Trait for the counter store shared by every node.
///
/// Implementations must make `add` and `increment` atomic on the server side;
/// the limiter takes no locks of its own. Every failure is reported as
/// [`WardenError::StoreUnavailable`](crate::error::WardenError::StoreUnavailable).
#[async_trait]
pub trait Store: Send + Sync {
    /// Read an integer value, `None` when the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<i64>>;

    /// Set `key` to `value` with a TTL only if it does not exist.
    ///
    /// Returns `true` if the value was written.
    async fn add(&self, key: &str, value: i64, ttl_secs: u64) -> Result<bool>;

    /// Set `key` to `value` with a TTL, overwriting any existing value.
    async fn put(&self, key: &str, value: i64, ttl_secs: u64) -> Result<()>;

    /// Atomically increment `key` by one and return the new value.
    ///
    /// A missing key is treated as zero. An existing TTL is preserved.
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn forget(&self, key: &str) -> Result<()>;
}
