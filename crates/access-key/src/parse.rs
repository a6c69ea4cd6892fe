//! Access key decoding.

use data_encoding::BASE64URL_NOPAD;

use crate::base62;
use crate::config::SEPARATOR;
use crate::error::{AccessKeyError, Result};
use crate::token::Version;

/// Decode `key` as the given version and return its project id.
///
/// v2 keys may carry any prefix; everything up to the final `:` is ignored.
pub fn decode(version: Version, key: &str) -> Result<u64> {
    let payload = match version {
        Version::V0 => base62::decode(key)?,
        Version::V1 => decode_base64url(key)?,
        Version::V2 => {
            let (_, encoded) = key
                .rsplit_once(SEPARATOR)
                .ok_or(AccessKeyError::InvalidFormat)?;
            decode_base64url(encoded)?
        }
    };

    if payload.len() != version.size() {
        return Err(AccessKeyError::InvalidLength {
            expected: version.size(),
            got: payload.len(),
        });
    }

    let offset = version.id_offset();
    if offset == 1 && payload[0] != version.as_u8() {
        return Err(AccessKeyError::UnexpectedVersion(payload[0]));
    }

    let mut id = [0u8; 8];
    id.copy_from_slice(&payload[offset..offset + 8]);
    Ok(u64::from_be_bytes(id))
}

/// Extract the project id from a key of unknown version.
///
/// Versions are tried newest first; the first one that decodes wins.
pub fn project_id(key: &str) -> Result<u64> {
    Version::DECODE_ORDER
        .iter()
        .find_map(|version| decode(*version, key).ok())
        .ok_or(AccessKeyError::Unrecognised)
}

fn decode_base64url(encoded: &str) -> Result<Vec<u8>> {
    BASE64URL_NOPAD
        .decode(encoded.trim_end_matches('=').as_bytes())
        .map_err(|_| AccessKeyError::InvalidEncoding("base64url"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::encode;
    use proptest::prelude::*;

    #[test]
    fn test_project_id_all_versions() {
        for version in Version::DECODE_ORDER {
            let key = encode(version, "seq", 987_654_321);
            assert_eq!(project_id(&key).unwrap(), 987_654_321, "{version}");
        }
    }

    #[test]
    fn test_v2_accepts_any_prefix() {
        let key = encode(Version::V2, "seq", 99);
        let (_, payload) = key.split_once(':').unwrap();
        let custom = format!("my:custom:prefix:{payload}");
        assert_eq!(decode(Version::V2, &custom).unwrap(), 99);
    }

    #[test]
    fn test_v2_requires_separator() {
        let key = encode(Version::V2, "seq", 99);
        let (_, payload) = key.split_once(':').unwrap();
        assert_eq!(
            decode(Version::V2, payload),
            Err(AccessKeyError::InvalidFormat)
        );
    }

    #[test]
    fn test_v1_accepts_padding() {
        let key = encode(Version::V1, "", 5);
        assert_eq!(decode(Version::V1, &format!("{key}=")).unwrap(), 5);
    }

    #[test]
    fn test_wrong_length() {
        let short = BASE64URL_NOPAD.encode(&[1u8; 10]);
        assert_eq!(
            decode(Version::V1, &short),
            Err(AccessKeyError::InvalidLength {
                expected: 26,
                got: 10
            })
        );
    }

    #[test]
    fn test_v0_legacy_key() {
        let key = "GyW3Dmm2Aa027OG14CW01a3C00000000";
        assert_eq!(decode(Version::V0, key).unwrap(), 12345);
        assert_eq!(project_id(key).unwrap(), 12345);
    }

    #[test]
    fn test_v0_rejects_oversized_payload() {
        assert_eq!(
            decode(Version::V0, &"z".repeat(40)),
            Err(AccessKeyError::InvalidLength {
                expected: 24,
                got: 30
            })
        );
    }

    #[test]
    fn test_garbage_is_unrecognised() {
        assert_eq!(project_id("not-a-key"), Err(AccessKeyError::Unrecognised));
        assert_eq!(project_id(""), Err(AccessKeyError::Unrecognised));
    }

    proptest! {
        #[test]
        fn prop_round_trip(id in any::<u64>(), v in 0u8..3) {
            let version = Version::try_from(v).unwrap();
            let key = encode(version, "seq", id);
            prop_assert_eq!(decode(version, &key).unwrap(), id);
            prop_assert_eq!(project_id(&key).unwrap(), id);
        }

        #[test]
        fn prop_exactly_one_version_decodes(id in any::<u64>(), v in 0u8..3) {
            let version = Version::try_from(v).unwrap();
            let key = encode(version, "seq", id);
            let accepted: Vec<Version> = Version::DECODE_ORDER
                .into_iter()
                .filter(|candidate| decode(*candidate, &key).is_ok())
                .collect();
            prop_assert_eq!(accepted, vec![version]);
        }
    }
}
