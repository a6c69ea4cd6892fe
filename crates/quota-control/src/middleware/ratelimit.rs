//! Per-minute request rate limiting.
//!
//! [`LocalRateCounter`] keeps estimates in-process with pingora's `Rate`;
//! [`SharedRateCounter`] counts fixed windows in the shared store so every
//! node sees the same totals.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pingora_limits::rate::Rate;

use super::session::{Session, SessionType};
use crate::cache::{Backend, CacheKey};
use crate::configuration::RateLimitConfig;
use crate::error::Result;
use crate::model::Service;

pub const RATE_WINDOW: Duration = Duration::from_secs(60);

#[async_trait]
pub trait RateLimitCounter: Send + Sync {
    /// Add `amount` to `key` and return the count for the current window.
    async fn increment(&self, key: &str, amount: i64) -> Result<i64>;

    fn window(&self) -> Duration;

    /// Seconds a rejected caller should wait.
    fn retry_after(&self) -> u64 {
        self.window().as_secs().max(1)
    }
}

// ============================================================================
// Local counter
// ============================================================================

/// In-process estimate over pingora's `Rate`. Counts are per node.
pub struct LocalRateCounter {
    rate: Rate,
    window: Duration,
}

impl LocalRateCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            rate: Rate::new(window),
            window,
        }
    }
}

#[async_trait]
impl RateLimitCounter for LocalRateCounter {
    async fn increment(&self, key: &str, amount: i64) -> Result<i64> {
        Ok(self.rate.observe(&key, amount as isize) as i64)
    }

    fn window(&self) -> Duration {
        self.window
    }
}

// ============================================================================
// Shared counter
// ============================================================================

/// Fixed-window counter in the shared store, keyed `<key>:<window index>`.
pub struct SharedRateCounter {
    backend: Arc<dyn Backend>,
    window: Duration,
}

impl SharedRateCounter {
    pub fn new(backend: Arc<dyn Backend>, window: Duration) -> Self {
        Self { backend, window }
    }

    fn window_secs(&self) -> i64 {
        self.window.as_secs().max(1) as i64
    }
}

#[async_trait]
impl RateLimitCounter for SharedRateCounter {
    async fn increment(&self, key: &str, amount: i64) -> Result<i64> {
        let index = Utc::now().timestamp().div_euclid(self.window_secs());
        self.backend
            .incr(&format!("{key}:{index}"), amount, self.window)
            .await
    }

    fn window(&self) -> Duration {
        self.window
    }

    fn retry_after(&self) -> u64 {
        let secs = self.window_secs();
        (secs - Utc::now().timestamp().rem_euclid(secs)) as u64
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Result of counting one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub limit: i64,
    pub count: i64,
    pub retry_after: u64,
}

impl RateDecision {
    pub fn allowed(&self) -> bool {
        self.count <= self.limit
    }

    pub fn remaining(&self) -> i64 {
        (self.limit - self.count).max(0)
    }
}

/// Picks the limit for a session and counts the request against it.
pub struct RateLimiter {
    counter: Arc<dyn RateLimitCounter>,
    config: RateLimitConfig,
    service: Service,
}

impl RateLimiter {
    pub fn new(counter: Arc<dyn RateLimitCounter>, config: RateLimitConfig, service: Service) -> Self {
        Self {
            counter,
            config,
            service,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Requests per minute for the session; `None` means unlimited.
    pub fn limit_for(&self, session: &Session) -> Option<i64> {
        let limit = if session.session_type == SessionType::Service {
            self.config.service_rpm
        } else if let Some(limit) = session
            .quota
            .as_ref()
            .and_then(|q| q.limit.service(self.service))
        {
            limit.rate_limit
        } else if session.account.is_some() {
            self.config.account_rpm
        } else {
            self.config.public_rpm
        };
        (limit > 0).then_some(limit)
    }

    /// Count a request costing `cost` compute units. Returns `None` for
    /// unlimited sessions.
    pub async fn check(&self, session: &Session, cost: i64) -> Result<Option<RateDecision>> {
        let Some(limit) = self.limit_for(session) else {
            return Ok(None);
        };
        let identity = session.identity();
        let key = CacheKey::RateLimit {
            service: self.service,
            identity: &identity,
        }
        .to_string();
        let count = self.counter.increment(&key, cost).await?;
        Ok(Some(RateDecision {
            limit,
            count,
            retry_after: self.counter.retry_after(),
        }))
    }
}
