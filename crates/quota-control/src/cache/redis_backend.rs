use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{RedisResult, Script};
use tokio::sync::{RwLock, Semaphore};
use tokio::time::timeout;

use super::Backend;
use crate::configuration::RedisConfig;
use crate::error::{QuotaError, Result};

const SPEND_SCRIPT: &str = r#"
local current = tonumber(redis.call("GET", KEYS[1]) or 0)
local amount = tonumber(ARGV[1]) or 0
local limit = tonumber(ARGV[2]) or 0
local new = math.max(current, math.min(limit, current + amount))
redis.call("SET", KEYS[1], new, "KEEPTTL")
if redis.call("PTTL", KEYS[1]) < 0 then
    redis.call("PEXPIRE", KEYS[1], ARGV[3])
end
return {new, new - current}
"#;

const INCR_SCRIPT: &str = r#"
local amount = tonumber(ARGV[1]) or 0
local count = redis.call("INCRBY", KEYS[1], amount)
if count == amount then
    redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return count
"#;

fn is_connection_error(err: &redis::RedisError) -> bool {
    err.is_connection_dropped()
        || err.is_io_error()
        || matches!(err.kind(), redis::ErrorKind::BusyLoadingError)
}

/// [`Backend`] over Redis.
///
/// A multiplexed connection is opened on first use and dropped after a
/// connection error or timeout so the next call reconnects. Every command
/// runs under a deadline and a bound on in-flight commands.
pub struct RedisBackend {
    client: redis::Client,
    conn: RwLock<Option<MultiplexedConnection>>,
    permits: Semaphore,
    timeout: Duration,
    spend_script: Script,
    incr_script: Script,
}

impl RedisBackend {
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url())?;
        Ok(Self {
            client,
            conn: RwLock::new(None),
            permits: Semaphore::new(config.max_active.max(1)),
            timeout: config.timeout,
            spend_script: Script::new(SPEND_SCRIPT),
            incr_script: Script::new(INCR_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.conn.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let mut guard = self.conn.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = timeout(self.timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| QuotaError::Timeout)??;
        log::info!("connected to redis");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_connection(&self) {
        *self.conn.write().await = None;
    }

    async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| QuotaError::Cache(e.to_string()))?;

        match timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if is_connection_error(&e) {
                    log::warn!("redis connection error, reconnecting on next call: {}", e);
                    self.reset_connection().await;
                }
                Err(e.into())
            }
            Err(_) => {
                log::warn!("redis command timed out after {:?}", self.timeout);
                self.reset_connection().await;
                Err(QuotaError::Timeout)
            }
        }
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        self.run(async move { redis::cmd("GET").arg(key).query_async(&mut conn).await })
            .await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let ttl_ms = ttl.as_millis().max(1) as u64;
        self.run(async move {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let reply: Option<String> = self
            .run(async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn clear(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = self
            .run(async move { redis::cmd("DEL").arg(key).query_async(&mut conn).await })
            .await?;
        Ok(removed > 0)
    }

    async fn spend(
        &self,
        key: &str,
        amount: i64,
        limit: i64,
        ttl: Duration,
    ) -> Result<(i64, i64)> {
        let mut conn = self.connection().await?;
        let script = &self.spend_script;
        let ttl_ms = ttl.as_millis().max(1) as u64;
        self.run(async move {
            script
                .key(key)
                .arg(amount)
                .arg(limit)
                .arg(ttl_ms)
                .invoke_async(&mut conn)
                .await
        })
        .await
    }

    async fn incr(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64> {
        let mut conn = self.connection().await?;
        let script = &self.incr_script;
        let ttl_ms = ttl.as_millis().max(1) as u64;
        self.run(async move {
            script
                .key(key)
                .arg(amount)
                .arg(ttl_ms)
                .invoke_async(&mut conn)
                .await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> RedisConfig {
        RedisConfig {
            enabled: true,
            host: "127.0.0.1".to_string(),
            ..RedisConfig::default()
        }
    }

    #[test]
    fn test_new_does_not_connect() {
        assert!(RedisBackend::new(&local_config()).is_ok());
    }

    #[tokio::test]
    #[ignore = "requires a redis server on 127.0.0.1:6379"]
    async fn test_spend_script_against_redis() {
        let backend = RedisBackend::new(&local_config()).unwrap();
        let key = "test:quota-control:spend";
        backend.clear(key).await.unwrap();
        let ttl = Duration::from_secs(60);
        backend.set(key, b"8", ttl).await.unwrap();
        assert_eq!(backend.spend(key, 1, 10, ttl).await.unwrap(), (9, 1));
        assert_eq!(backend.spend(key, 5, 10, ttl).await.unwrap(), (10, 1));
        assert_eq!(backend.spend(key, 1, 10, ttl).await.unwrap(), (10, 0));
        assert!(!backend.set_nx(key, b"-1", Duration::from_secs(2)).await.unwrap());
        assert!(backend.clear(key).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires a redis server on 127.0.0.1:6379"]
    async fn test_spend_on_fresh_key_expires() {
        let backend = RedisBackend::new(&local_config()).unwrap();
        let key = "test:quota-control:spend-fresh";
        backend.clear(key).await.unwrap();
        assert_eq!(
            backend
                .spend(key, 3, 10, Duration::from_millis(100))
                .await
                .unwrap(),
            (3, 3)
        );
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(backend.get(key).await.unwrap(), None);
    }
}
