//! Error taxonomy shared by the client, the authority and the middleware.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by quota operations.
///
/// Business rejections map to 4xx statuses and are surfaced to the caller.
/// Infrastructure faults ([`QuotaError::is_transient`]) are logged and the
/// request is let through.
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("Access key not found")]
    AccessKeyNotFound,

    #[error("Access key mismatch")]
    AccessKeyMismatch,

    #[error("Invalid origin for Access Key")]
    InvalidOrigin,

    #[error("Service not enabled for Access key")]
    InvalidService,

    #[error("Unauthorized user")]
    UnauthorizedUser,

    #[error("Session expired")]
    SessionExpired,

    #[error("Quota request exceeded")]
    QuotaExceeded,

    #[error("Request limit exceeded")]
    LimitExceeded,

    #[error("Rate-limited. Please slow down.")]
    RateLimited,

    #[error("Project not found")]
    ProjectNotFound,

    #[error("No default access key found")]
    NoDefaultKey,

    #[error("Access keys limit reached")]
    MaxAccessKeys,

    #[error("You need at least one Access Key")]
    AtLeastOneKey,

    #[error("Invalid limit: {0}")]
    InvalidLimit(String),

    #[error("Request timed out")]
    Timeout,

    /// Shared cache failure.
    #[error("cache error: {0}")]
    Cache(String),

    /// Authority failure.
    #[error("authority error: {0}")]
    Authority(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("{0} is not implemented")]
    Unimplemented(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl QuotaError {
    /// HTTP status used when the error is written to a client.
    pub fn status(&self) -> u16 {
        match self {
            QuotaError::AccessKeyNotFound | QuotaError::ProjectNotFound => 404,
            QuotaError::AccessKeyMismatch | QuotaError::SessionExpired => 401,
            QuotaError::InvalidOrigin
            | QuotaError::InvalidService
            | QuotaError::UnauthorizedUser => 403,
            QuotaError::QuotaExceeded | QuotaError::LimitExceeded | QuotaError::RateLimited => 429,
            QuotaError::NoDefaultKey => 404,
            QuotaError::MaxAccessKeys | QuotaError::AtLeastOneKey | QuotaError::InvalidLimit(_) => {
                400
            }
            QuotaError::Timeout => 504,
            QuotaError::Unimplemented(_) => 501,
            QuotaError::Cache(_)
            | QuotaError::Authority(_)
            | QuotaError::Store(_)
            | QuotaError::Config(_) => 500,
        }
    }

    /// Stable numeric error code.
    pub fn code(&self) -> u32 {
        match self {
            QuotaError::Unimplemented(_) => 1001,
            QuotaError::SessionExpired => 1002,
            QuotaError::RateLimited => 1007,
            QuotaError::ProjectNotFound => 1008,
            QuotaError::AccessKeyNotFound => 1101,
            QuotaError::AccessKeyMismatch => 1102,
            QuotaError::InvalidOrigin => 1103,
            QuotaError::InvalidService => 1104,
            QuotaError::UnauthorizedUser => 1105,
            QuotaError::QuotaExceeded => 1200,
            QuotaError::LimitExceeded => 1201,
            QuotaError::InvalidLimit(_) => 1202,
            QuotaError::NoDefaultKey => 1300,
            QuotaError::MaxAccessKeys => 1301,
            QuotaError::AtLeastOneKey => 1302,
            QuotaError::Timeout => 1900,
            QuotaError::Cache(_)
            | QuotaError::Authority(_)
            | QuotaError::Store(_)
            | QuotaError::Config(_) => 1000,
        }
    }

    /// Short machine-readable name of the error kind.
    pub fn name(&self) -> &'static str {
        match self {
            QuotaError::AccessKeyNotFound => "AccessKeyNotFound",
            QuotaError::AccessKeyMismatch => "AccessKeyMismatch",
            QuotaError::InvalidOrigin => "InvalidOrigin",
            QuotaError::InvalidService => "InvalidService",
            QuotaError::UnauthorizedUser => "UnauthorizedUser",
            QuotaError::SessionExpired => "SessionExpired",
            QuotaError::QuotaExceeded => "QuotaExceeded",
            QuotaError::LimitExceeded => "LimitExceeded",
            QuotaError::RateLimited => "RateLimited",
            QuotaError::ProjectNotFound => "ProjectNotFound",
            QuotaError::NoDefaultKey => "NoDefaultKey",
            QuotaError::MaxAccessKeys => "MaxAccessKeys",
            QuotaError::AtLeastOneKey => "AtLeastOneKey",
            QuotaError::InvalidLimit(_) => "InvalidLimit",
            QuotaError::Timeout => "Timeout",
            QuotaError::Cache(_) => "CacheError",
            QuotaError::Authority(_) => "AuthorityError",
            QuotaError::Store(_) => "StoreError",
            QuotaError::Unimplemented(_) => "Unimplemented",
            QuotaError::Config(_) => "ConfigError",
        }
    }

    /// Infrastructure faults that the request path fails open on.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QuotaError::Timeout
                | QuotaError::Cache(_)
                | QuotaError::Authority(_)
                | QuotaError::Store(_)
        )
    }
}

impl From<redis::RedisError> for QuotaError {
    fn from(e: redis::RedisError) -> Self {
        QuotaError::Cache(e.to_string())
    }
}

impl From<serde_json::Error> for QuotaError {
    fn from(e: serde_json::Error) -> Self {
        QuotaError::Cache(format!("codec: {e}"))
    }
}

/// Result type alias for quota operations.
pub type Result<T> = std::result::Result<T, QuotaError>;

/// JSON body written for rejected requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub code: u32,
    pub cause: String,
    pub msg: String,
    pub error: String,
}

impl ErrorResponse {
    /// Build the response body, optionally overriding the public message.
    pub fn new(err: &QuotaError, message: Option<&str>) -> Self {
        let msg = message
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        Self {
            status: err.status(),
            code: err.code(),
            cause: err.to_string(),
            msg,
            error: err.name().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(QuotaError::AccessKeyNotFound.status(), 404);
        assert_eq!(QuotaError::AccessKeyMismatch.status(), 401);
        assert_eq!(QuotaError::InvalidOrigin.status(), 403);
        assert_eq!(QuotaError::InvalidService.status(), 403);
        assert_eq!(QuotaError::UnauthorizedUser.status(), 403);
        assert_eq!(QuotaError::QuotaExceeded.status(), 429);
        assert_eq!(QuotaError::LimitExceeded.status(), 429);
    }

    #[test]
    fn test_transient_classification() {
        assert!(QuotaError::Timeout.is_transient());
        assert!(QuotaError::Cache("down".into()).is_transient());
        assert!(QuotaError::Authority("down".into()).is_transient());
        assert!(!QuotaError::QuotaExceeded.is_transient());
        assert!(!QuotaError::AccessKeyNotFound.is_transient());
    }

    #[test]
    fn test_error_response_body() {
        let body = ErrorResponse::new(&QuotaError::QuotaExceeded, None);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], 429);
        assert_eq!(json["code"], 1200);
        assert_eq!(json["error"], "QuotaExceeded");
        assert_eq!(json["msg"], "Quota request exceeded");

        let custom = ErrorResponse::new(&QuotaError::QuotaExceeded, Some("upgrade your plan"));
        assert_eq!(custom.msg, "upgrade your plan");
        assert_eq!(custom.cause, "Quota request exceeded");
    }
}
