//! Request pipeline: session, quota verification, rate limiting, usage check
//! and spend.
//!
//! The pipeline is transport-agnostic. It reads headers through
//! [`RequestHeaders`] and returns an [`Outcome`] carrying the response headers
//! and, for rejected requests, the error to render.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::client::{QuotaClient, SpendOutcome};
use crate::configuration::ErrorConfig;
use crate::error::{ErrorResponse, QuotaError, Result};
use crate::model::{ServiceLimit, UserPermission};

mod ratelimit;
mod session;

pub use ratelimit::{
    LocalRateCounter, RATE_WINDOW, RateDecision, RateLimitCounter, RateLimiter, SharedRateCounter,
};
pub use session::{
    ACCESS_KEY_HEADER, AUTHORIZATION_HEADER, Claims, ClaimsVerifier, KeyExtractor, ORIGIN_HEADER,
    RequestHeaders, Session, SessionType, access_key_header, bearer_token,
};

pub const COMPUTE_UNITS_HEADER: &str = "x-compute-units";

pub const QUOTA_LIMIT: &str = "Quota-Limit";
pub const QUOTA_REMAINING: &str = "Quota-Remaining";
pub const QUOTA_OVERAGE: &str = "Quota-Overage";
pub const QUOTA_COST: &str = "Quota-Cost";
pub const RATELIMIT_INCREMENT: &str = "X-RateLimit-Increment";
pub const RATELIMIT_LIMIT: &str = "X-RateLimit-Limit";
pub const RATELIMIT_REMAINING: &str = "X-RateLimit-Remaining";
pub const RETRY_AFTER: &str = "Retry-After";

/// Result of running the pipeline over one request.
#[derive(Debug, Default)]
pub struct Outcome {
    pub session: Session,
    /// Compute units this request costs.
    pub cost: i64,
    pub headers: Vec<(&'static str, String)>,
    pub rejection: Option<QuotaError>,
    /// Public message overriding the error's default.
    pub message: Option<String>,
    /// Stages that failed open.
    pub degraded: Vec<&'static str>,
}

impl Outcome {
    fn set_header(&mut self, name: &'static str, value: impl ToString) {
        let value = value.to_string();
        match self.headers.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name, value)),
        }
    }

    fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| *n != name);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Project the request is attributed to, if any stage learned it.
    pub fn project_id(&self) -> Option<u64> {
        self.session
            .quota
            .as_ref()
            .map(|q| q.project_id)
            .or(self.session.project_id)
            .or(self.session.key_project_id)
    }

    pub fn is_rejected(&self) -> bool {
        self.rejection.is_some()
    }

    /// HTTP status to answer with; 200 when the request passes.
    pub fn status(&self) -> u16 {
        self.rejection.as_ref().map_or(200, QuotaError::status)
    }

    pub fn error_response(&self) -> Option<ErrorResponse> {
        self.rejection
            .as_ref()
            .map(|e| ErrorResponse::new(e, self.message.as_deref()))
    }

    /// Usage headers for a counter at `usage`.
    fn set_usage(&mut self, limit: &ServiceLimit, usage: i64) {
        self.set_header(QUOTA_LIMIT, limit.free_max);
        self.set_header(QUOTA_REMAINING, (limit.free_max - usage).max(0));
        let overage = (usage - limit.free_max).max(0);
        if overage > 0 {
            self.set_header(QUOTA_OVERAGE, overage);
        } else {
            self.remove_header(QUOTA_OVERAGE);
        }
    }
}

pub struct Pipeline {
    client: Arc<QuotaClient>,
    verifier: Option<Arc<dyn ClaimsVerifier>>,
    extractors: Vec<KeyExtractor>,
    rate_limiter: Option<RateLimiter>,
    ensure_usage: bool,
    errors: ErrorConfig,
}

impl Pipeline {
    pub fn new(client: Arc<QuotaClient>) -> Self {
        Self {
            client,
            verifier: None,
            extractors: vec![access_key_header()],
            rate_limiter: None,
            ensure_usage: false,
            errors: ErrorConfig::default(),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn ClaimsVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Replace the access-key extractors; the first hit wins.
    pub fn with_extractors(mut self, extractors: Vec<KeyExtractor>) -> Self {
        self.extractors = extractors;
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Reject up front when the request would overrun the hard limit.
    pub fn with_ensure_usage(mut self, enabled: bool) -> Self {
        self.ensure_usage = enabled;
        self
    }

    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    pub fn client(&self) -> &Arc<QuotaClient> {
        &self.client
    }

    /// Run every stage in order.
    ///
    /// Business errors reject the request and stop the pipeline. Transient
    /// errors are logged and the remaining stages still run.
    pub async fn handle(
        &self,
        req: &dyn RequestHeaders,
        client_ip: Option<&str>,
        now: DateTime<Utc>,
    ) -> Outcome {
        let mut out = Outcome {
            cost: self.request_cost(req),
            ..Outcome::default()
        };
        out.session.client_ip = client_ip.map(str::to_string);

        let session = self.session(req, &mut out);
        if self.settle(&mut out, "session", session) {
            return out;
        }
        let verified = self.verify_quota(&mut out, now).await;
        if self.settle(&mut out, "verify_quota", verified) {
            return out;
        }
        let limited = self.rate_limit(&mut out).await;
        if self.settle(&mut out, "rate_limit", limited) {
            return out;
        }
        if self.ensure_usage {
            let ensured = self.ensure_usage(&mut out, now).await;
            if self.settle(&mut out, "ensure_usage", ensured) {
                return out;
            }
        }
        let spent = self.spend_usage(&mut out, now).await;
        self.settle(&mut out, "spend_usage", spent);
        out
    }

    /// Returns true when the request is rejected.
    fn settle(&self, out: &mut Outcome, stage: &'static str, result: Result<()>) -> bool {
        match result {
            Ok(()) => false,
            Err(e) if e.is_transient() => {
                log::warn!("{}: letting request through: {}", stage, e);
                out.degraded.push(stage);
                false
            }
            Err(e) => {
                out.message = self.message_for(&e, &out.session);
                out.rejection = Some(e);
                true
            }
        }
    }

    fn message_for(&self, err: &QuotaError, session: &Session) -> Option<String> {
        let configured = match err {
            QuotaError::QuotaExceeded | QuotaError::LimitExceeded => &self.errors.quota_message,
            QuotaError::RateLimited if session.session_type == SessionType::Public => {
                if !self.errors.public_message.is_empty() {
                    &self.errors.public_message
                } else {
                    &self.errors.ratelimit_message
                }
            }
            QuotaError::RateLimited => &self.errors.ratelimit_message,
            _ => return None,
        };
        if !configured.is_empty() {
            return Some(configured.clone());
        }
        match (err, &self.rate_limiter) {
            (QuotaError::RateLimited, Some(limiter)) if !limiter.config().error_msg.is_empty() => {
                Some(limiter.config().error_msg.clone())
            }
            _ => None,
        }
    }

    fn request_cost(&self, req: &dyn RequestHeaders) -> i64 {
        match req.header(COMPUTE_UNITS_HEADER) {
            Some(value) => match value.trim().parse::<i64>() {
                Ok(cost) if cost >= 0 => cost,
                _ => {
                    log::debug!("Ignoring invalid {} header {:?}", COMPUTE_UNITS_HEADER, value);
                    self.client.get_default_usage()
                }
            },
            None => self.client.get_default_usage(),
        }
    }

    // ------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------

    fn session(&self, req: &dyn RequestHeaders, out: &mut Outcome) -> Result<()> {
        out.session.origin = req.header(ORIGIN_HEADER).unwrap_or_default().to_string();

        if let Some(token) = bearer_token(req) {
            match &self.verifier {
                Some(verifier) => {
                    let claims = verifier.verify(token)?;
                    out.session.apply_claims(claims)?;
                }
                None => log::debug!("Bearer token ignored: no verifier configured"),
            }
        }

        if let Some(key) = self.extractors.iter().find_map(|extract| extract(req)) {
            out.session.apply_access_key(key)?;
        }
        Ok(())
    }

    async fn verify_quota(&self, out: &mut Outcome, now: DateTime<Utc>) -> Result<()> {
        let session = &out.session;

        if let (Some(claimed), Some(keyed)) = (session.project_id, session.key_project_id) {
            if claimed != keyed {
                return Err(QuotaError::AccessKeyMismatch);
            }
        }

        if session.session_type == SessionType::Project {
            if let (Some(project_id), Some(account)) = (session.project_id, &session.account) {
                match self
                    .client
                    .check_permission(project_id, account, UserPermission::Read)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => return Err(QuotaError::UnauthorizedUser),
                    Err(e) if e.is_transient() => {
                        log::warn!(
                            "Permission check for {}/{} unavailable, letting request through: {}",
                            project_id,
                            account,
                            e
                        );
                        out.degraded.push("check_permission");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let quota = match (&session.access_key, session.project_id) {
            (Some(access_key), _) => {
                self.client
                    .fetch_key_quota(access_key, &session.origin, now)
                    .await?
            }
            (None, Some(project_id))
                if matches!(
                    session.session_type,
                    SessionType::Project | SessionType::Admin
                ) =>
            {
                self.client.fetch_project_quota(project_id, now).await?
            }
            _ => None,
        };

        if let Some(quota) = &quota {
            if let Some(limit) = quota.limit.service(self.client.service()) {
                out.set_header(QUOTA_LIMIT, limit.free_max);
            }
        }
        out.session.quota = quota;
        Ok(())
    }

    async fn rate_limit(&self, out: &mut Outcome) -> Result<()> {
        let Some(limiter) = &self.rate_limiter else {
            return Ok(());
        };
        let Some(decision) = limiter.check(&out.session, out.cost).await? else {
            return Ok(());
        };
        out.set_header(RATELIMIT_LIMIT, decision.limit);
        out.set_header(RATELIMIT_REMAINING, decision.remaining());
        if !decision.allowed() {
            out.set_header(RETRY_AFTER, decision.retry_after);
            return Err(QuotaError::RateLimited);
        }
        Ok(())
    }

    async fn ensure_usage(&self, out: &mut Outcome, now: DateTime<Utc>) -> Result<()> {
        let Some(quota) = &out.session.quota else {
            return Ok(());
        };
        let Some(limit) = quota.limit.service(self.client.service()).copied() else {
            return Ok(());
        };
        if out.cost == 0 {
            return Ok(());
        }

        let usage = self.client.fetch_usage(quota, now).await;
        out.set_header(RATELIMIT_INCREMENT, out.cost);
        let usage = usage?;
        out.set_usage(&limit, usage);
        if usage + out.cost > limit.over_max {
            return Err(QuotaError::LimitExceeded);
        }
        Ok(())
    }

    async fn spend_usage(&self, out: &mut Outcome, now: DateTime<Utc>) -> Result<()> {
        if !self.client.is_enabled() || out.cost == 0 {
            return Ok(());
        }
        let Some(quota) = &out.session.quota else {
            return Ok(());
        };
        let Some(limit) = quota.limit.service(self.client.service()).copied() else {
            return Ok(());
        };

        let spent = self.client.spend_quota(quota, out.cost, now).await?;
        out.set_header(QUOTA_COST, out.cost);
        match spent {
            SpendOutcome::Spent { total } => {
                out.set_usage(&limit, total);
                Ok(())
            }
            SpendOutcome::Exceeded { total } => {
                out.set_usage(&limit, total);
                Err(QuotaError::QuotaExceeded)
            }
            SpendOutcome::Skipped | SpendOutcome::Unverified => Ok(()),
        }
    }
}
