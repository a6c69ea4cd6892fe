use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::SharedCache;
use crate::error::Result;

const DEFAULT_SIZE: usize = 1000;
const DEFAULT_EXPIRY: Duration = Duration::from_secs(60);

/// Process-local LRU in front of the shared cache.
///
/// Reads fill the local layer from the shared one. Writes and clears go to
/// the shared layer first and only touch the local layer once that
/// succeeded, so a failed write never leaves a value that peers can't see.
pub struct LruCache<V> {
    mem: Mutex<lru_time_cache::LruCache<String, V>>,
    shared: Option<SharedCache>,
}

impl<V> LruCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    /// Zero `size` or `expiry` fall back to 1000 entries and one minute.
    pub fn new(shared: Option<SharedCache>, size: usize, expiry: Duration) -> Self {
        let size = if size == 0 { DEFAULT_SIZE } else { size };
        let expiry = if expiry.is_zero() {
            DEFAULT_EXPIRY
        } else {
            expiry
        };
        Self {
            mem: Mutex::new(lru_time_cache::LruCache::with_expiry_duration_and_capacity(
                expiry, size,
            )),
            shared,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        if let Some(value) = self.mem.lock().expect("local cache poisoned").get(key) {
            return Ok(Some(value.clone()));
        }

        let Some(shared) = &self.shared else {
            return Ok(None);
        };
        let value = shared.get::<V>(key).await?;
        if let Some(value) = &value {
            self.mem
                .lock()
                .expect("local cache poisoned")
                .insert(key.to_string(), value.clone());
        }
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: &V) -> Result<()> {
        if let Some(shared) = &self.shared {
            shared.set(key, value).await?;
        }
        self.mem
            .lock()
            .expect("local cache poisoned")
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    /// Returns true when either layer held the key.
    pub async fn clear(&self, key: &str) -> Result<bool> {
        let removed_shared = match &self.shared {
            Some(shared) => shared.clear(key).await?,
            None => false,
        };
        let removed_local = self
            .mem
            .lock()
            .expect("local cache poisoned")
            .remove(key)
            .is_some();
        Ok(removed_shared || removed_local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Backend, MemoryBackend};
    use crate::error::QuotaError;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FailingBackend;

    #[async_trait]
    impl Backend for FailingBackend {
        async fn get(&self, _: &str) -> Result<Option<Vec<u8>>> {
            Err(QuotaError::Cache("down".into()))
        }
        async fn set(&self, _: &str, _: &[u8], _: Duration) -> Result<()> {
            Err(QuotaError::Cache("down".into()))
        }
        async fn set_nx(&self, _: &str, _: &[u8], _: Duration) -> Result<bool> {
            Err(QuotaError::Cache("down".into()))
        }
        async fn clear(&self, _: &str) -> Result<bool> {
            Err(QuotaError::Cache("down".into()))
        }
        async fn spend(&self, _: &str, _: i64, _: i64, _: Duration) -> Result<(i64, i64)> {
            Err(QuotaError::Cache("down".into()))
        }
        async fn incr(&self, _: &str, _: i64, _: Duration) -> Result<i64> {
            Err(QuotaError::Cache("down".into()))
        }
    }

    fn shared(backend: Arc<dyn Backend>) -> SharedCache {
        SharedCache::new(backend, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_read_fills_local_layer() {
        let backend = Arc::new(MemoryBackend::new());
        let writer: LruCache<u64> = LruCache::new(Some(shared(backend.clone())), 10, Duration::ZERO);
        let reader: LruCache<u64> = LruCache::new(Some(shared(backend.clone())), 10, Duration::ZERO);

        writer.set("a", &42).await.unwrap();
        assert_eq!(reader.get("a").await.unwrap(), Some(42));

        // Served locally once the shared copy is gone.
        backend.flush();
        assert_eq!(reader.get("a").await.unwrap(), Some(42));
        assert_eq!(reader.get("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_local_untouched() {
        let cache: LruCache<u64> = LruCache::new(Some(shared(Arc::new(FailingBackend))), 10, Duration::ZERO);
        assert!(cache.set("a", &1).await.is_err());
        assert!(cache.get("a").await.is_err());
    }

    #[tokio::test]
    async fn test_clear_removes_both_layers() {
        let backend = Arc::new(MemoryBackend::new());
        let cache: LruCache<u64> = LruCache::new(Some(shared(backend.clone())), 10, Duration::ZERO);
        cache.set("a", &1).await.unwrap();
        assert!(cache.clear("a").await.unwrap());
        assert_eq!(cache.get("a").await.unwrap(), None);
        assert!(!cache.clear("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_local_only() {
        let cache: LruCache<String> = LruCache::new(None, 1, Duration::from_secs(60));
        cache.set("a", &"x".to_string()).await.unwrap();
        cache.set("b", &"y".to_string()).await.unwrap();
        // Capacity of one evicts the older entry.
        assert_eq!(cache.get("a").await.unwrap(), None);
        assert_eq!(cache.get("b").await.unwrap(), Some("y".to_string()));
    }
}
