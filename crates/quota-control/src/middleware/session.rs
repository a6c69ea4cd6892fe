//! Caller identification: access keys, bearer claims and session types.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{QuotaError, Result};
use crate::model::AccessQuota;

pub const ACCESS_KEY_HEADER: &str = "x-access-key";
pub const AUTHORIZATION_HEADER: &str = "authorization";
pub const ORIGIN_HEADER: &str = "origin";

/// Read-only view over request headers. Lookups are case-insensitive.
pub trait RequestHeaders: Sync {
    fn header(&self, name: &str) -> Option<&str>;
}

impl RequestHeaders for HashMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Pulls an access key out of a request.
pub type KeyExtractor = Arc<dyn Fn(&dyn RequestHeaders) -> Option<String> + Send + Sync>;

/// The default extractor: the `X-Access-Key` header.
pub fn access_key_header() -> KeyExtractor {
    Arc::new(|req: &dyn RequestHeaders| {
        req.header(ACCESS_KEY_HEADER)
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
    })
}

/// Caller class, ordered by privilege.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionType {
    #[default]
    Public,
    Account,
    AccessKey,
    Project,
    Admin,
    Service,
}

/// Claims carried by a bearer token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub project: Option<u64>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub admin: bool,
    /// Origin the token is pinned to.
    #[serde(default)]
    pub ogn: Option<String>,
}

/// Verifies a bearer token and returns its claims.
///
/// Implementations fail with `SessionExpired` for stale tokens and
/// `UnauthorizedUser` for anything they cannot verify.
pub trait ClaimsVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Claims>;
}

/// Everything known about the caller of one request.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub session_type: SessionType,
    pub origin: String,
    pub client_ip: Option<String>,
    pub access_key: Option<String>,
    /// Project decoded from the access key.
    pub key_project_id: Option<u64>,
    /// Project from the bearer claims.
    pub project_id: Option<u64>,
    pub account: Option<String>,
    pub service: Option<String>,
    pub quota: Option<AccessQuota>,
}

impl Session {
    fn raise(&mut self, session_type: SessionType) {
        self.session_type = self.session_type.max(session_type);
    }

    /// Apply bearer claims.
    pub fn apply_claims(&mut self, claims: Claims) -> Result<()> {
        if let Some(pinned) = claims.ogn.as_deref() {
            if !crate::origin::matches(pinned, &self.origin) {
                return Err(QuotaError::UnauthorizedUser);
            }
        }

        if let Some(service) = claims.service {
            self.service = Some(service);
            self.raise(SessionType::Service);
            return Ok(());
        }
        if let Some(account) = claims.account {
            self.account = Some(account);
            if claims.admin {
                self.raise(SessionType::Admin);
            } else if let Some(project) = claims.project {
                self.project_id = Some(project);
                self.raise(SessionType::Project);
            } else {
                self.raise(SessionType::Account);
            }
        }
        if claims.admin {
            self.project_id = self.project_id.or(claims.project);
        }
        Ok(())
    }

    /// Attach an access key and the project it encodes.
    pub fn apply_access_key(&mut self, access_key: String) -> Result<()> {
        let project_id =
            access_key::project_id(&access_key).map_err(|_| QuotaError::AccessKeyNotFound)?;
        self.access_key = Some(access_key);
        self.key_project_id = Some(project_id);
        self.raise(SessionType::AccessKey);
        Ok(())
    }

    /// Rate-limit identity, from most to least specific.
    pub fn identity(&self) -> String {
        if let Some(service) = &self.service {
            return format!("service:{service}");
        }
        if let Some(quota) = &self.quota {
            return format!("project:{}", quota.project_id);
        }
        if let Some(account) = &self.account {
            return format!("account:{account}");
        }
        format!("ip:{}", self.client_ip.as_deref().unwrap_or("unknown"))
    }
}

/// Token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(req: &dyn RequestHeaders) -> Option<&str> {
    let value = req.header(AUTHORIZATION_HEADER)?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(
            bearer_token(&headers(&[("Authorization", "Bearer abc")])),
            Some("abc")
        );
        assert_eq!(
            bearer_token(&headers(&[("authorization", "bearer  abc ")])),
            Some("abc")
        );
        assert_eq!(bearer_token(&headers(&[("Authorization", "Basic abc")])), None);
        assert_eq!(bearer_token(&headers(&[("Authorization", "Bearer ")])), None);
        assert_eq!(bearer_token(&headers(&[])), None);
    }

    #[test]
    fn test_access_key_extractor() {
        let extract = access_key_header();
        assert_eq!(
            extract(&headers(&[("X-Access-Key", " k ")])),
            Some("k".to_string())
        );
        assert_eq!(extract(&headers(&[("X-Access-Key", "")])), None);
    }

    #[test]
    fn test_session_type_order() {
        assert!(SessionType::Public < SessionType::Account);
        assert!(SessionType::AccessKey < SessionType::Project);
        assert!(SessionType::Admin < SessionType::Service);
    }

    #[test]
    fn test_claims() {
        let mut session = Session::default();
        session
            .apply_claims(Claims {
                project: Some(9),
                account: Some("0xabc".into()),
                ..Claims::default()
            })
            .unwrap();
        assert_eq!(session.session_type, SessionType::Project);
        assert_eq!(session.project_id, Some(9));

        let mut admin = Session::default();
        admin
            .apply_claims(Claims {
                account: Some("0xabc".into()),
                admin: true,
                ..Claims::default()
            })
            .unwrap();
        assert_eq!(admin.session_type, SessionType::Admin);

        let mut service = Session::default();
        service
            .apply_claims(Claims {
                service: Some("indexer".into()),
                ..Claims::default()
            })
            .unwrap();
        assert_eq!(service.session_type, SessionType::Service);
        assert_eq!(service.identity(), "service:indexer");
    }

    #[test]
    fn test_pinned_origin() {
        let mut session = Session {
            origin: "https://evil.com".into(),
            ..Session::default()
        };
        let claims = Claims {
            account: Some("a".into()),
            ogn: Some("https://app.example.com".into()),
            ..Claims::default()
        };
        assert!(matches!(
            session.apply_claims(claims),
            Err(QuotaError::UnauthorizedUser)
        ));
    }

    #[test]
    fn test_access_key_raises_public_only() {
        let key = access_key::encode(access_key::Version::V2, "seq", 42);

        let mut public = Session::default();
        public.apply_access_key(key.clone()).unwrap();
        assert_eq!(public.session_type, SessionType::AccessKey);
        assert_eq!(public.key_project_id, Some(42));

        let mut project = Session {
            session_type: SessionType::Project,
            ..Session::default()
        };
        project.apply_access_key(key).unwrap();
        assert_eq!(project.session_type, SessionType::Project);

        assert!(matches!(
            Session::default().apply_access_key("not-a-key".into()),
            Err(QuotaError::AccessKeyNotFound)
        ));
    }

    #[test]
    fn test_identity_fallback() {
        let session = Session {
            client_ip: Some("10.0.0.1".into()),
            ..Session::default()
        };
        assert_eq!(session.identity(), "ip:10.0.0.1");
        assert_eq!(Session::default().identity(), "ip:unknown");
    }
}
