use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::Backend;
use crate::error::{QuotaError, Result};

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-process [`Backend`] for single-node deployments and tests.
///
/// Every operation runs under one lock, which makes the conditional and
/// arithmetic operations atomic.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().expect("memory backend poisoned");
        entries.values().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub fn flush(&self) {
        self.entries.lock().expect("memory backend poisoned").clear();
    }
}

fn parse_int(key: &str, raw: &[u8]) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| QuotaError::Cache(format!("value at {key} is not an integer")))
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().expect("memory backend poisoned");
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().expect("memory backend poisoned");
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("memory backend poisoned");
        if entries.get(key).is_some_and(|e| e.expires_at > now) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn clear(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().expect("memory backend poisoned");
        Ok(entries
            .remove(key)
            .is_some_and(|e| e.expires_at > Instant::now()))
    }

    async fn spend(
        &self,
        key: &str,
        amount: i64,
        limit: i64,
        ttl: Duration,
    ) -> Result<(i64, i64)> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("memory backend poisoned");
        let (current, expires_at) = match entries.get(key) {
            Some(entry) if entry.expires_at > now => (parse_int(key, &entry.value)?, entry.expires_at),
            _ => (0, now + ttl),
        };
        let new = (current + amount).min(limit).max(current);
        entries.insert(
            key.to_string(),
            Entry {
                value: new.to_string().into_bytes(),
                expires_at,
            },
        );
        Ok((new, new - current))
    }

    async fn incr(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("memory backend poisoned");
        let (current, expires_at) = match entries.get(key) {
            Some(entry) if entry.expires_at > now => (parse_int(key, &entry.value)?, entry.expires_at),
            _ => (0, now + ttl),
        };
        let new = current + amount;
        entries.insert(
            key.to_string(),
            Entry {
                value: new.to_string().into_bytes(),
                expires_at,
            },
        );
        Ok(new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_respects_existing() {
        let backend = MemoryBackend::new();
        assert!(backend.set_nx("k", b"-1", Duration::from_secs(2)).await.unwrap());
        assert!(!backend.set_nx("k", b"-1", Duration::from_secs(2)).await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), Some(b"-1".to_vec()));
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let backend = MemoryBackend::new();
        backend.set("k", b"1", Duration::from_millis(20)).await.unwrap();
        assert_eq!(backend.len(), 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(backend.set_nx("k", b"2", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_spend_clamps_to_limit() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(60);
        backend.set("c", b"8", ttl).await.unwrap();
        assert_eq!(backend.spend("c", 1, 10, ttl).await.unwrap(), (9, 1));
        assert_eq!(backend.spend("c", 5, 10, ttl).await.unwrap(), (10, 1));
        assert_eq!(backend.spend("c", 1, 10, ttl).await.unwrap(), (10, 0));
        assert_eq!(backend.spend("fresh", 3, 10, ttl).await.unwrap(), (3, 3));
    }

    #[tokio::test]
    async fn test_spend_on_fresh_key_expires() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_millis(20);
        assert_eq!(backend.spend("fresh", 3, 10, ttl).await.unwrap(), (3, 3));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(backend.get("fresh").await.unwrap(), None);

        // An existing key keeps its own expiry.
        backend.set("c", b"1", Duration::from_secs(60)).await.unwrap();
        backend.spend("c", 1, 10, ttl).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(backend.get("c").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_clear_and_incr() {
        let backend = MemoryBackend::new();
        assert!(!backend.clear("missing").await.unwrap());
        assert_eq!(backend.incr("r", 1, Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(backend.incr("r", 2, Duration::from_secs(60)).await.unwrap(), 3);
        assert!(backend.clear("r").await.unwrap());
        backend.flush();
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_spend_rejects_non_integer() {
        let backend = MemoryBackend::new();
        backend.set("c", b"{}", Duration::from_secs(60)).await.unwrap();
        assert!(backend.spend("c", 1, 10, Duration::from_secs(60)).await.is_err());
    }
}
