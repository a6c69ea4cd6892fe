//! Quota data model: services, limits, cycles, access keys and usage deltas.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QuotaError;
use crate::origin;

// ============================================================================
// Services
// ============================================================================

/// Platform services a quota applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Service {
    NodeGateway,
    API,
    Indexer,
    Relayer,
    Metadata,
    Marketplace,
    Builder,
    WaaS,
}

impl Service {
    pub const ALL: [Service; 8] = [
        Service::NodeGateway,
        Service::API,
        Service::Indexer,
        Service::Relayer,
        Service::Metadata,
        Service::Marketplace,
        Service::Builder,
        Service::WaaS,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::NodeGateway => "NodeGateway",
            Service::API => "API",
            Service::Indexer => "Indexer",
            Service::Relayer => "Relayer",
            Service::Metadata => "Metadata",
            Service::Marketplace => "Marketplace",
            Service::Builder => "Builder",
            Service::WaaS => "WaaS",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Service::ALL
            .into_iter()
            .find(|service| service.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| QuotaError::Config(format!("unknown service {s:?}")))
    }
}

// ============================================================================
// Limits
// ============================================================================

/// Threshold events raised as a project's usage grows within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    FreeWarn,
    FreeMax,
    OverWarn,
    OverMax,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Limits for one service.
///
/// `free_warn` and `over_warn` are optional notification thresholds; zero
/// disables them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLimit {
    /// Requests per minute.
    pub rate_limit: i64,
    #[serde(default)]
    pub free_warn: i64,
    pub free_max: i64,
    #[serde(default)]
    pub over_warn: i64,
    pub over_max: i64,
}

impl ServiceLimit {
    pub fn validate(&self) -> Result<(), QuotaError> {
        if self.rate_limit < 1 {
            return Err(QuotaError::InvalidLimit("rate_limit must be > 0".into()));
        }
        if self.free_max < 1 {
            return Err(QuotaError::InvalidLimit("free_max must be > 0".into()));
        }
        if self.over_max < self.free_max {
            return Err(QuotaError::InvalidLimit(
                "over_max must be >= free_max".into(),
            ));
        }
        if self.free_warn > self.free_max {
            return Err(QuotaError::InvalidLimit(
                "free_warn must be <= free_max".into(),
            ));
        }
        if self.over_warn > 0 && (self.over_warn < self.free_max || self.over_warn > self.over_max) {
            return Err(QuotaError::InvalidLimit(
                "over_warn must be between free_max and over_max".into(),
            ));
        }
        Ok(())
    }

    /// Classify a spend of `cost` units that brought the counter to `total`.
    ///
    /// Returns the usage split into free, overage and refused units and the
    /// highest threshold crossed by this spend, if any.
    pub fn spend_result(&self, cost: i64, total: i64) -> (UsageDelta, Option<EventType>) {
        let prev = total - cost;
        let span = |low: i64, high: i64| total.clamp(low, high) - prev.clamp(low, high);

        let delta = UsageDelta {
            valid_compute: span(0, self.free_max),
            over_compute: span(self.free_max, self.over_max),
            limited_compute: total.max(self.over_max) - prev.max(self.over_max),
        };

        let thresholds = [
            (self.over_max, EventType::OverMax),
            (self.over_warn, EventType::OverWarn),
            (self.free_max, EventType::FreeMax),
            (self.free_warn, EventType::FreeWarn),
        ];
        let event = thresholds
            .into_iter()
            .find(|(threshold, _)| *threshold > 0 && prev < *threshold && *threshold <= total)
            .map(|(_, event)| event);

        (delta, event)
    }
}

/// Per-project limit: key allowance plus one entry per enabled service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    /// Maximum number of active access keys; zero means unlimited.
    #[serde(default)]
    pub max_keys: i64,
    #[serde(default)]
    pub services: BTreeMap<Service, ServiceLimit>,
}

impl Limit {
    pub fn service(&self, service: Service) -> Option<&ServiceLimit> {
        self.services.get(&service)
    }

    pub fn with_service(mut self, service: Service, limit: ServiceLimit) -> Self {
        self.services.insert(service, limit);
        self
    }

    pub fn validate(&self) -> Result<(), QuotaError> {
        if self.max_keys < 0 {
            return Err(QuotaError::InvalidLimit("max_keys must be >= 0".into()));
        }
        for (service, limit) in &self.services {
            limit
                .validate()
                .map_err(|e| QuotaError::InvalidLimit(format!("{service}: {e}")))?;
        }
        Ok(())
    }
}

// ============================================================================
// Cycles
// ============================================================================

/// Billing window, half-open `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cycle {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Cycle {
    /// Calendar month (UTC) containing `now`.
    pub fn for_time(now: DateTime<Utc>) -> Self {
        let start = Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(now);
        let end = start.checked_add_months(Months::new(1)).unwrap_or(start);
        Cycle { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// Shift the cycle by whole months until it contains `now`.
    ///
    /// Cached descriptors outlive month boundaries; resolving against the
    /// request time keeps the counter key on the right cycle.
    pub fn resolve(&self, now: DateTime<Utc>) -> Cycle {
        if self.end <= self.start {
            return Cycle::for_time(now);
        }
        let mut cycle = *self;
        while cycle.end <= now {
            match cycle.shift(Months::new(1), true) {
                Some(next) => cycle = next,
                None => return Cycle::for_time(now),
            }
        }
        while cycle.start > now {
            match cycle.shift(Months::new(1), false) {
                Some(prev) => cycle = prev,
                None => return Cycle::for_time(now),
            }
        }
        cycle
    }

    fn shift(&self, months: Months, forward: bool) -> Option<Cycle> {
        let (start, end) = if forward {
            (
                self.start.checked_add_months(months)?,
                self.end.checked_add_months(months)?,
            )
        } else {
            (
                self.start.checked_sub_months(months)?,
                self.end.checked_sub_months(months)?,
            )
        };
        Some(Cycle { start, end })
    }

    /// `YYYY-MM-DD-YYYY-MM-DD` form used in counter keys.
    pub fn date_range(&self) -> String {
        format!(
            "{}-{}",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }
}

// ============================================================================
// Access keys and descriptors
// ============================================================================

/// Project-scoped credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessKey {
    pub access_key: String,
    pub project_id: u64,
    pub display_name: String,
    pub active: bool,
    #[serde(rename = "default")]
    pub is_default: bool,
    #[serde(default)]
    pub require_origin: bool,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub allowed_services: Vec<Service>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl AccessKey {
    /// An empty origin passes unless the key requires one.
    pub fn validate_origin(&self, origin: &str) -> bool {
        if origin.is_empty() {
            return !self.require_origin;
        }
        origin::matches_any(&self.allowed_origins, origin)
    }

    /// An empty service list enables every service.
    pub fn validate_service(&self, service: Service) -> bool {
        self.allowed_services.is_empty() || self.allowed_services.contains(&service)
    }
}

/// Quota descriptor: the bundle cached per access key or project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessQuota {
    pub project_id: u64,
    /// `None` for project-scoped (JWT) callers.
    pub access_key: Option<AccessKey>,
    pub limit: Limit,
    pub cycle: Cycle,
}

impl AccessQuota {
    pub fn is_active(&self) -> bool {
        self.access_key.as_ref().is_none_or(|key| key.active)
    }
}

/// Permission a user holds on a project.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum UserPermission {
    #[default]
    Unauthorized,
    Read,
    ReadWrite,
    Admin,
}

impl UserPermission {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => UserPermission::Read,
            2 => UserPermission::ReadWrite,
            3 => UserPermission::Admin,
            _ => UserPermission::Unauthorized,
        }
    }
}

// ============================================================================
// Usage
// ============================================================================

/// Compute units split by class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDelta {
    /// Within the free tier.
    pub valid_compute: i64,
    /// Within the overage allowance.
    pub over_compute: i64,
    /// Refused.
    pub limited_compute: i64,
}

impl UsageDelta {
    pub fn valid(units: i64) -> Self {
        Self {
            valid_compute: units,
            ..Self::default()
        }
    }

    pub fn limited(units: i64) -> Self {
        Self {
            limited_compute: units,
            ..Self::default()
        }
    }

    /// Units counted against the budget (valid + over).
    pub fn total(&self) -> i64 {
        self.valid_compute + self.over_compute
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

impl Add for UsageDelta {
    type Output = UsageDelta;

    fn add(self, rhs: UsageDelta) -> UsageDelta {
        UsageDelta {
            valid_compute: self.valid_compute + rhs.valid_compute,
            over_compute: self.over_compute + rhs.over_compute,
            limited_compute: self.limited_compute + rhs.limited_compute,
        }
    }
}

impl AddAssign for UsageDelta {
    fn add_assign(&mut self, rhs: UsageDelta) {
        *self = *self + rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit() -> ServiceLimit {
        ServiceLimit {
            rate_limit: 100,
            free_warn: 5,
            free_max: 10,
            over_warn: 15,
            over_max: 20,
        }
    }

    #[test]
    fn test_validate_service_limit() {
        assert!(limit().validate().is_ok());
        let cases = [
            ServiceLimit { rate_limit: 1, ..Default::default() },
            ServiceLimit { rate_limit: 1, free_max: 1, ..Default::default() },
            ServiceLimit { rate_limit: 0, free_max: 1, over_max: 1, ..Default::default() },
            ServiceLimit { rate_limit: 1, free_warn: 3, free_max: 2, over_max: 2, ..Default::default() },
            ServiceLimit { rate_limit: 1, free_max: 2, over_warn: 1, over_max: 3, ..Default::default() },
        ];
        for case in cases {
            assert!(case.validate().is_err(), "{case:?}");
        }
        let ok = ServiceLimit { rate_limit: 1, free_max: 2, over_max: 2, ..Default::default() };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_spend_result_table() {
        let l = limit();
        // (cost, total) -> (valid, over, limited, event)
        let cases = [
            (1, 1, (1, 0, 0), None),
            (1, 5, (1, 0, 0), Some(EventType::FreeWarn)),
            (1, 6, (1, 0, 0), None),
            (2, 11, (1, 1, 0), Some(EventType::FreeMax)),
            (3, 13, (0, 3, 0), None),
            (6, 16, (0, 6, 0), Some(EventType::OverWarn)),
            (20, 20, (10, 10, 0), Some(EventType::OverMax)),
            (5, 25, (0, 0, 5), None),
        ];
        for (cost, total, (valid, over, limited), event) in cases {
            let (delta, got) = l.spend_result(cost, total);
            assert_eq!(
                delta,
                UsageDelta { valid_compute: valid, over_compute: over, limited_compute: limited },
                "cost={cost} total={total}"
            );
            assert_eq!(got, event, "cost={cost} total={total}");
        }
    }

    #[test]
    fn test_spend_result_skips_disabled_warnings() {
        let l = ServiceLimit { rate_limit: 1, free_max: 5, over_max: 10, ..Default::default() };
        assert_eq!(l.spend_result(1, 1).1, None);
        assert_eq!(l.spend_result(1, 5).1, Some(EventType::FreeMax));
    }

    #[test]
    fn test_cycle_for_time_is_calendar_month() {
        let now = Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap();
        let cycle = Cycle::for_time(now);
        assert_eq!(cycle.start, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(cycle.end, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        assert!(cycle.contains(now));
        assert!(!cycle.contains(cycle.end));
        assert_eq!(cycle.date_range(), "2024-01-01-2024-02-01");
    }

    #[test]
    fn test_cycle_resolve_rolls_over() {
        let cycle = Cycle::for_time(Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap());
        let later = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        let resolved = cycle.resolve(later);
        assert_eq!(resolved, Cycle::for_time(later));

        let earlier = Utc.with_ymd_and_hms(2023, 12, 31, 0, 0, 0).unwrap();
        assert_eq!(cycle.resolve(earlier), Cycle::for_time(earlier));

        let inside = Utc.with_ymd_and_hms(2024, 1, 20, 0, 0, 0).unwrap();
        assert_eq!(cycle.resolve(inside), cycle);
    }

    #[test]
    fn test_usage_delta_add() {
        let a = UsageDelta { valid_compute: 1, over_compute: 2, limited_compute: 3 };
        let mut b = UsageDelta::valid(4);
        b += a;
        assert_eq!(b, UsageDelta { valid_compute: 5, over_compute: 2, limited_compute: 3 });
        assert_eq!(b.total(), 7);
        assert!(UsageDelta::default().is_zero());
    }

    #[test]
    fn test_service_parse() {
        assert_eq!("nodegateway".parse::<Service>().unwrap(), Service::NodeGateway);
        assert_eq!(Service::WaaS.to_string(), "WaaS");
        assert!("nope".parse::<Service>().is_err());
    }

    #[test]
    fn test_access_key_service_and_origin() {
        let mut key = AccessKey {
            access_key: "k".into(),
            project_id: 1,
            display_name: "d".into(),
            active: true,
            is_default: true,
            require_origin: false,
            allowed_origins: vec![],
            allowed_services: vec![],
            created_at: None,
        };
        assert!(key.validate_service(Service::API));
        assert!(key.validate_origin(""));
        assert!(key.validate_origin("https://any.example"));

        key.allowed_services = vec![Service::Indexer];
        assert!(!key.validate_service(Service::API));

        key.require_origin = true;
        assert!(!key.validate_origin(""));
    }

    #[test]
    fn test_user_permission_order() {
        assert!(UserPermission::Admin > UserPermission::ReadWrite);
        assert!(UserPermission::Read > UserPermission::Unauthorized);
        assert_eq!(UserPermission::from_i64(UserPermission::ReadWrite.as_i64()), UserPermission::ReadWrite);
    }
}
