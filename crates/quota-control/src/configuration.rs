use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::QuotaError;
use crate::model::Service;

/// Top-level document read by the binary. pingora's own settings live in the
/// file passed with `-c`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the proxy listens on.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// `host:port` requests are forwarded to.
    pub upstream: String,
    /// Service this node enforces quota for.
    pub service: Service,
    /// SQLite file backing the authority.
    pub authority_db: String,
    #[serde(default)]
    pub access_key: AccessKeySettings,
    #[serde(default)]
    pub quota: Config,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccessKeySettings {
    pub version: u8,
    pub prefix: String,
}

impl Default for AccessKeySettings {
    fn default() -> Self {
        Self {
            version: 2,
            prefix: access_key::DEFAULT_PREFIX.to_string(),
        }
    }
}

impl AccessKeySettings {
    pub fn to_config(&self) -> Result<access_key::AccessKeyConfig, QuotaError> {
        let version = access_key::Version::try_from(self.version)
            .map_err(|e| QuotaError::Config(e.to_string()))?;
        Ok(access_key::AccessKeyConfig::new(version).with_prefix(self.prefix.clone()))
    }
}

/// Quota client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub enabled: bool,
    /// Remote authority location. The bundled server runs the authority
    /// in-process and only reports this value.
    pub url: String,
    pub auth_token: String,
    #[serde(deserialize_with = "deserialize_duration")]
    pub update_freq: Duration,
    pub rate_limiter: RateLimitConfig,
    pub redis: RedisConfig,
    pub default_usage: i64,
    pub lru_size: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub lru_expiration: Duration,
    pub errors: ErrorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            url: String::new(),
            auth_token: String::new(),
            update_freq: Duration::from_secs(60),
            rate_limiter: RateLimitConfig::default(),
            redis: RedisConfig::default(),
            default_usage: 1,
            lru_size: 1000,
            lru_expiration: Duration::from_secs(60),
            errors: ErrorConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), QuotaError> {
        if self.update_freq.is_zero() {
            return Err(QuotaError::Config("update_freq must be > 0".into()));
        }
        if self.default_usage < 0 {
            return Err(QuotaError::Config("default_usage must be >= 0".into()));
        }
        if self.redis.enabled && self.redis.host.is_empty() {
            return Err(QuotaError::Config("redis.host is required".into()));
        }
        if self.redis.max_active == 0 {
            return Err(QuotaError::Config("redis.max_active must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub public_rpm: i64,
    pub account_rpm: i64,
    /// Zero leaves service sessions unlimited.
    pub service_rpm: i64,
    pub error_msg: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            public_rpm: 120,
            account_rpm: 4000,
            service_rpm: 0,
            error_msg: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub db_index: i64,
    /// Accepted for compatibility; the multiplexed connection keeps no idle pool.
    pub max_idle: usize,
    /// Maximum in-flight commands.
    pub max_active: usize,
    /// TTL of usage counters.
    #[serde(deserialize_with = "deserialize_duration")]
    pub key_ttl: Duration,
    /// TTL of cached descriptors and permissions.
    #[serde(deserialize_with = "deserialize_duration")]
    pub cache_ttl: Duration,
    /// Per-command deadline.
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: 6379,
            db_index: 0,
            max_idle: 4,
            max_active: 8,
            key_ttl: Duration::from_secs(24 * 3600),
            cache_ttl: Duration::from_secs(60),
            timeout: Duration::from_millis(500),
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db_index)
    }
}

/// Overrides for public error messages. Empty keeps the default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ErrorConfig {
    pub quota_message: String,
    pub ratelimit_message: String,
    pub public_message: String,
}

/// Parse `"1m"`, `"30s"`, `"500ms"`, `"1h30m"` or a bare number of seconds.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty duration".into());
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in {text:?}"))?;
        if digits == 0 {
            return Err(format!("invalid duration {text:?}"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid duration {text:?}"))?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            other => return Err(format!("unknown unit {other:?} in {text:?}")),
        };
        total += unit;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}
