use std::fmt;

use crate::model::{Cycle, Service};

/// Keys in the shared store. The versioned prefixes allow the JSON layout
/// to change without clashing with older values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKey<'a> {
    /// `quota:v2:<access key>`
    AccessQuota(&'a str),
    /// `project:v2:<project id>`
    ProjectQuota(u64),
    /// `perm:v2:<project id>:<user id>`
    Permission { project_id: u64, user_id: &'a str },
    /// `usage:<service>:<project id>:<start>-<end>`, an unversioned integer.
    Usage {
        service: Service,
        project_id: u64,
        cycle: &'a Cycle,
    },
    /// `rl:<service>:<identity>`
    RateLimit { service: Service, identity: &'a str },
}

impl fmt::Display for CacheKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::AccessQuota(key) => write!(f, "quota:v2:{key}"),
            CacheKey::ProjectQuota(id) => write!(f, "project:v2:{id}"),
            CacheKey::Permission {
                project_id,
                user_id,
            } => write!(f, "perm:v2:{project_id}:{user_id}"),
            CacheKey::Usage {
                service,
                project_id,
                cycle,
            } => write!(f, "usage:{service}:{project_id}:{}", cycle.date_range()),
            CacheKey::RateLimit { service, identity } => write!(f, "rl:{service}:{identity}"),
        }
    }
}
