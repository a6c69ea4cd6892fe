//! Configuration for access key generation.

use crate::token::Version;

/// Separator between the v2 prefix and the encoded payload.
pub const SEPARATOR: char = ':';

/// Prefix used for v2 keys when none is configured.
pub const DEFAULT_PREFIX: &str = "seq";

/// Configuration for access key generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKeyConfig {
    /// Version new keys are generated with.
    pub version: Version,
    /// Prefix for v2 keys (e.g., "seq" produces "seq:...").
    pub prefix: String,
}

impl Default for AccessKeyConfig {
    fn default() -> Self {
        Self {
            version: Version::V2,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl AccessKeyConfig {
    /// Create a new config for the given version with the default prefix.
    pub fn new(version: Version) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    /// Set the v2 prefix. An empty prefix falls back to the default.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.prefix = if prefix.is_empty() {
            DEFAULT_PREFIX.to_string()
        } else {
            prefix
        };
        self
    }
}
