use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::Backend;
use crate::error::{QuotaError, Result};

/// Retries after the first read before a peek gives up.
pub const PEEK_ATTEMPTS: u32 = 3;

/// Lifetime of the initialization claim.
pub const SENTINEL_TTL: Duration = Duration::from_secs(2);

const SENTINEL: i64 = -1;
const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);

/// Shared compute-unit counter, one key per project, service and cycle.
///
/// A key is absent, initializing (holds `-1` for [`SENTINEL_TTL`] while one
/// caller fetches the authoritative value) or ready (holds the units spent).
pub struct UsageCounter {
    backend: Arc<dyn Backend>,
    ttl: Duration,
    backoff: Duration,
}

impl UsageCounter {
    /// `ttl` applies to ready values.
    pub fn new(backend: Arc<dyn Backend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Base wait between peek attempts; attempt `n` waits `n * backoff`.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Raw counter value without initializing. The sentinel reads as `None`.
    pub async fn get(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.read(key).await?.filter(|v| *v >= 0))
    }

    /// Overwrite the counter with a ready value.
    pub async fn set(&self, key: &str, value: i64) -> Result<()> {
        self.backend
            .set(key, value.to_string().as_bytes(), self.ttl)
            .await
    }

    /// Delete the counter so the next peek re-initializes it.
    pub async fn clear(&self, key: &str) -> Result<bool> {
        self.backend.clear(key).await
    }

    /// Resolve the counter to a ready value.
    ///
    /// When the key is absent, the caller that wins the `SETNX` claim runs
    /// `fetcher` and stores its result; everyone else waits for it. Fails with
    /// [`QuotaError::Timeout`] when the counter is still not ready after
    /// [`PEEK_ATTEMPTS`] waits.
    pub async fn peek<F, Fut>(&self, key: &str, fetcher: F) -> Result<i64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<i64>>,
    {
        let mut fetcher = Some(fetcher);
        for attempt in 0..=PEEK_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(self.backoff * attempt).await;
            }

            match self.read(key).await? {
                Some(value) if value >= 0 => return Ok(value),
                Some(_) => continue,
                None => {}
            }

            let claimed = self
                .backend
                .set_nx(key, SENTINEL.to_string().as_bytes(), SENTINEL_TTL)
                .await?;
            if !claimed {
                continue;
            }
            let Some(fetch) = fetcher.take() else {
                break;
            };

            match fetch().await {
                Ok(value) => {
                    self.set(key, value).await?;
                    return Ok(value);
                }
                Err(e) => {
                    // Release the claim so a peer can retry right away.
                    if let Err(clear_err) = self.backend.clear(key).await {
                        log::warn!("usage counter {}: failed to release claim: {}", key, clear_err);
                    }
                    return Err(e);
                }
            }
        }
        Err(QuotaError::Timeout)
    }

    /// Spend up to `amount` units without passing `limit`.
    ///
    /// Returns `(total, spent)`; `spent < amount` means the limit was hit.
    pub async fn spend<F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        amount: i64,
        limit: i64,
    ) -> Result<(i64, i64)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<i64>>,
    {
        let current = self.peek(key, fetcher).await?;
        if current >= limit {
            return Ok((current, 0));
        }
        self.backend.spend(key, amount, limit, self.ttl).await
    }

    async fn read(&self, key: &str) -> Result<Option<i64>> {
        match self.backend.get(key).await? {
            Some(raw) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .map(Some)
                .ok_or_else(|| QuotaError::Cache(format!("usage counter {key} is not an integer"))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter(backend: Arc<MemoryBackend>) -> UsageCounter {
        UsageCounter::new(backend, Duration::from_secs(60)).with_backoff(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_peek_initializes_once() {
        let backend = Arc::new(MemoryBackend::new());
        let counter = Arc::new(counter(backend));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let counter = counter.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                counter
                    .peek("usage:k", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok(7)
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_peek_times_out_on_stuck_sentinel() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set("usage:k", b"-1", Duration::from_secs(60)).await.unwrap();
        let result = counter(backend).peek("usage:k", || async { Ok(1) }).await;
        assert!(matches!(result, Err(QuotaError::Timeout)));
    }

    #[tokio::test]
    async fn test_failed_fetch_releases_claim() {
        let backend = Arc::new(MemoryBackend::new());
        let counter = counter(backend.clone());
        let result = counter
            .peek("usage:k", || async { Err(QuotaError::Authority("down".into())) })
            .await;
        assert!(matches!(result, Err(QuotaError::Authority(_))));
        assert_eq!(backend.get("usage:k").await.unwrap(), None);
        assert_eq!(counter.peek("usage:k", || async { Ok(3) }).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_spend_bounded_by_limit() {
        let backend = Arc::new(MemoryBackend::new());
        let counter = Arc::new(counter(backend));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                counter.spend("usage:k", || async { Ok(0) }, 1, 10).await
            }));
        }
        let mut spent = 0;
        for handle in handles {
            let (total, units) = handle.await.unwrap().unwrap();
            assert!(total <= 10);
            spent += units;
        }
        assert_eq!(spent, 10);
        assert_eq!(counter.get("usage:k").await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_spend_sums_when_under_limit() {
        let backend = Arc::new(MemoryBackend::new());
        let counter = counter(backend);
        for amount in [1, 2, 3, 4] {
            counter.spend("usage:k", || async { Ok(5) }, amount, 100).await.unwrap();
        }
        assert_eq!(counter.get("usage:k").await.unwrap(), Some(15));
    }

    #[tokio::test]
    async fn test_spend_at_limit_spends_nothing() {
        let backend = Arc::new(MemoryBackend::new());
        let counter = counter(backend);
        assert_eq!(counter.spend("usage:k", || async { Ok(10) }, 1, 10).await.unwrap(), (10, 0));
        assert_eq!(counter.spend("usage:k", || async { Ok(0) }, 4, 12).await.unwrap(), (12, 2));
    }

    #[tokio::test]
    async fn test_set_clear_and_get() {
        let backend = Arc::new(MemoryBackend::new());
        let counter = counter(backend);
        assert_eq!(counter.get("usage:k").await.unwrap(), None);
        counter.set("usage:k", 4).await.unwrap();
        assert_eq!(counter.get("usage:k").await.unwrap(), Some(4));
        assert!(counter.clear("usage:k").await.unwrap());
        assert_eq!(counter.get("usage:k").await.unwrap(), None);
    }
}
