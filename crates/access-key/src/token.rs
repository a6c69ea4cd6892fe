//! Access key generation.

use data_encoding::BASE64URL_NOPAD;
use rand::RngCore;

use crate::base62;
use crate::config::{AccessKeyConfig, SEPARATOR};
use crate::error::AccessKeyError;

/// Supported access key layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Version {
    V0,
    V1,
    V2,
}

impl Version {
    /// Decode order used when the version of a key is unknown.
    pub const DECODE_ORDER: [Version; 3] = [Version::V2, Version::V1, Version::V0];

    /// Numeric version, also the header byte for v1 and v2.
    pub fn as_u8(self) -> u8 {
        match self {
            Version::V0 => 0,
            Version::V1 => 1,
            Version::V2 => 2,
        }
    }

    /// Size of the decoded payload in bytes.
    pub fn size(self) -> usize {
        match self {
            Version::V0 => 24,
            Version::V1 => 26,
            Version::V2 => 32,
        }
    }

    /// Offset of the big-endian project id inside the payload.
    pub(crate) fn id_offset(self) -> usize {
        match self {
            Version::V0 => 0,
            Version::V1 | Version::V2 => 1,
        }
    }
}

impl TryFrom<u8> for Version {
    type Error = AccessKeyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Version::V0),
            1 => Ok(Version::V1),
            2 => Ok(Version::V2),
            other => Err(AccessKeyError::UnsupportedVersion(other)),
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}

/// Generate a new access key for `project_id` using the configured version.
pub fn generate(config: &AccessKeyConfig, project_id: u64) -> String {
    encode(config.version, &config.prefix, project_id)
}

/// Encode `project_id` with an explicit version.
///
/// The trailing bytes after the header are filled from the OS RNG. `prefix`
/// is only used by v2.
pub fn encode(version: Version, prefix: &str, project_id: u64) -> String {
    let mut payload = vec![0u8; version.size()];
    let offset = version.id_offset();
    if offset == 1 {
        payload[0] = version.as_u8();
    }
    payload[offset..offset + 8].copy_from_slice(&project_id.to_be_bytes());
    rand::rngs::OsRng.fill_bytes(&mut payload[offset + 8..]);

    match version {
        Version::V0 => base62::encode(&payload),
        Version::V1 => BASE64URL_NOPAD.encode(&payload),
        Version::V2 => format!("{}{}{}", prefix, SEPARATOR, BASE64URL_NOPAD.encode(&payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_v2_format() {
        let config = AccessKeyConfig::default();
        let key = generate(&config, 42);

        let (prefix, payload) = key.split_once(SEPARATOR).unwrap();
        assert_eq!(prefix, "seq");
        let bytes = BASE64URL_NOPAD.decode(payload.as_bytes()).unwrap();
        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes[0], 2);
        assert_eq!(&bytes[1..9], &42u64.to_be_bytes());
    }

    #[test]
    fn test_v1_scenario() {
        let key = encode(Version::V1, "", 12345);
        let bytes = BASE64URL_NOPAD.decode(key.as_bytes()).unwrap();
        assert_eq!(bytes.len(), 26);
        assert_eq!(bytes[0], 1);
        assert_eq!(crate::decode(Version::V1, &key).unwrap(), 12345);
    }

    #[test]
    fn test_v0_scenario() {
        for id in [0, 12345, u64::MAX] {
            let key = encode(Version::V0, "", id);
            assert!((32..=39).contains(&key.len()), "{key}");
            assert!(key.bytes().all(|c| c.is_ascii_alphanumeric()));
            assert_eq!(crate::decode(Version::V0, &key).unwrap(), id);
        }
    }

    #[test]
    fn test_generate_unique_keys() {
        let config = AccessKeyConfig::new(Version::V1);
        assert_ne!(generate(&config, 7), generate(&config, 7));
    }

    #[test]
    fn test_version_from_u8() {
        assert_eq!(Version::try_from(2).unwrap(), Version::V2);
        assert_eq!(
            Version::try_from(9),
            Err(AccessKeyError::UnsupportedVersion(9))
        );
    }
}
