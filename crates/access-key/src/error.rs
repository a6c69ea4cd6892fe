//! Error types for access key operations.

use thiserror::Error;

/// Errors that can occur while decoding an access key.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessKeyError {
    /// Outer encoding (base62 / base64url) could not be decoded.
    #[error("Invalid {0} encoding")]
    InvalidEncoding(&'static str),

    /// Decoded payload has the wrong size for the version.
    #[error("Invalid access key length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    /// v2 key without a `prefix:` part.
    #[error("Invalid access key format")]
    InvalidFormat,

    /// Header byte doesn't match the version being decoded.
    #[error("Unexpected version byte: {0}")]
    UnexpectedVersion(u8),

    /// Version number is not supported.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u8),

    /// No version could decode the key.
    #[error("Access key not recognised by any version")]
    Unrecognised,
}

/// Result type alias for access key operations.
pub type Result<T> = std::result::Result<T, AccessKeyError>;
