//! Shared cache backend and the caches built on top of it.
//!
//! [`Backend`] is the byte-level contract over a Redis-compatible store.
//! [`SharedCache`] adds JSON values with a default TTL and [`LruCache`] puts a
//! process-local layer in front of it. [`QuotaCache`] groups the descriptor
//! caches and [`UsageCounter`] implements the distributed spend counter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

mod counter;
mod descriptor;
mod keys;
mod lru;
mod memory;
mod redis_backend;

pub use counter::{PEEK_ATTEMPTS, SENTINEL_TTL, UsageCounter};
pub use descriptor::QuotaCache;
pub use keys::CacheKey;
pub use lru::LruCache;
pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;

/// Default TTL for cached values.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Byte-level operations on the shared store. Implementations must be safe
/// for concurrent use; `set_nx`, `spend` and `incr` must be atomic.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Set only if absent. Returns true when the value was written.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Delete a key. Returns true when something was removed.
    async fn clear(&self, key: &str) -> Result<bool>;

    /// Atomically add `amount` to the integer at `key`, clamped to `limit`.
    /// An existing key keeps its TTL; a new one expires after `ttl`. Returns
    /// `(new, new - current)`.
    async fn spend(&self, key: &str, amount: i64, limit: i64, ttl: Duration)
    -> Result<(i64, i64)>;

    /// Atomically add `amount` to the integer at `key`; a new key expires
    /// after `ttl`. Returns the new value.
    async fn incr(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64>;
}

/// JSON values over a [`Backend`].
#[derive(Clone)]
pub struct SharedCache {
    backend: Arc<dyn Backend>,
    ttl: Duration,
}

impl SharedCache {
    /// A zero TTL falls back to [`DEFAULT_TTL`].
    pub fn new(backend: Arc<dyn Backend>, ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_TTL } else { ttl };
        Self { backend, ttl }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        self.backend.set(key, &raw, self.ttl).await
    }

    pub async fn clear(&self, key: &str) -> Result<bool> {
        self.backend.clear(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UsageDelta;

    #[tokio::test]
    async fn test_shared_cache_json_round_trip() {
        let cache = SharedCache::new(Arc::new(MemoryBackend::new()), Duration::ZERO);
        assert_eq!(cache.ttl(), DEFAULT_TTL);

        let value = UsageDelta { valid_compute: 3, over_compute: 2, limited_compute: 1 };
        cache.set("k", &value).await.unwrap();
        assert_eq!(cache.get::<UsageDelta>("k").await.unwrap(), Some(value));
        assert!(cache.clear("k").await.unwrap());
        assert_eq!(cache.get::<UsageDelta>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_shared_cache_rejects_garbage() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set("k", b"not json", DEFAULT_TTL).await.unwrap();
        let cache = SharedCache::new(backend, DEFAULT_TTL);
        assert!(cache.get::<UsageDelta>("k").await.is_err());
    }
}
