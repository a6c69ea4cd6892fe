//! The quota authority: access-key lifecycle, descriptor assembly and usage
//! bookkeeping over a transactional store.
//!
//! The authority keeps no state of its own beyond the shared caches. Every
//! mutation evicts the affected descriptors so the next request refetches.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use access_key::AccessKeyConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::cache::{CacheKey, QuotaCache, UsageCounter};
use crate::error::{QuotaError, Result};
use crate::model::{
    AccessKey, AccessQuota, Cycle, EventType, Limit, Service, UsageDelta, UserPermission,
};

mod sqlite;
mod store;

pub use sqlite::SqliteStore;
pub use store::{AccessKeyStore, CycleStore, LimitStore, PermissionStore, Store, UsageStore};

// ============================================================================
// Client-facing contract
// ============================================================================

/// Operations the quota client needs from the authority.
#[async_trait]
pub trait QuotaControl: Send + Sync {
    /// Descriptor for an access key. Fails with `AccessKeyNotFound` or
    /// `ProjectNotFound`.
    async fn get_access_quota(&self, access_key: &str, now: DateTime<Utc>) -> Result<AccessQuota>;

    async fn get_project_quota(&self, project_id: u64, now: DateTime<Utc>) -> Result<AccessQuota>;

    /// Project-wide usage. A missing bound defaults to the current cycle.
    async fn get_account_usage(
        &self,
        project_id: u64,
        service: Option<Service>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<UsageDelta>;

    async fn notify_event(&self, project_id: u64, service: Service, event: EventType)
    -> Result<bool>;

    /// Record one minute bucket of per-key usage; returns which entries were
    /// stored.
    async fn update_key_usage(
        &self,
        service: Service,
        bucket: DateTime<Utc>,
        usage: HashMap<String, UsageDelta>,
    ) -> Result<HashMap<String, bool>>;

    async fn update_project_usage(
        &self,
        service: Service,
        bucket: DateTime<Utc>,
        usage: HashMap<u64, UsageDelta>,
    ) -> Result<HashMap<u64, bool>>;

    async fn get_user_permission(&self, project_id: u64, user_id: &str)
    -> Result<UserPermission>;
}

// ============================================================================
// Request types
// ============================================================================

/// Settings for a new access key.
#[derive(Debug, Clone, Default)]
pub struct NewAccessKey {
    pub display_name: String,
    pub require_origin: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_services: Vec<Service>,
}

/// Partial update of an access key; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct AccessKeyUpdate {
    pub display_name: Option<String>,
    pub require_origin: Option<bool>,
    pub allowed_origins: Option<Vec<String>>,
    pub allowed_services: Option<Vec<Service>>,
}

/// Live view of a project's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectStatus {
    pub project_id: u64,
    pub limit: Limit,
    pub cycle: Cycle,
    /// Current counter per limited service; `None` when not initialised.
    pub usage: BTreeMap<Service, Option<i64>>,
}

// ============================================================================
// Authority
// ============================================================================

pub struct Authority {
    store: Store,
    cache: Arc<QuotaCache>,
    counter: Arc<UsageCounter>,
    key_config: AccessKeyConfig,
}

impl Authority {
    pub fn new(
        store: Store,
        cache: Arc<QuotaCache>,
        counter: Arc<UsageCounter>,
        key_config: AccessKeyConfig,
    ) -> Self {
        Self {
            store,
            cache,
            counter,
            key_config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ------------------------------------------------------------------
    // Cycles and usage
    // ------------------------------------------------------------------

    /// Fill missing bounds from the project's cycle at `now`.
    pub async fn get_time_range(
        &self,
        project_id: u64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        if let (Some(from), Some(to)) = (from, to) {
            return Ok((from, to));
        }
        let cycle = self.store.cycles.get_access_cycle(project_id, now).await?;
        Ok((from.unwrap_or(cycle.start), to.unwrap_or(cycle.end)))
    }

    /// Usage read dispatch: `None` sums the whole project, `Some("")` only
    /// project-level usage and `Some(key)` a single access key.
    pub async fn get_usage(
        &self,
        project_id: u64,
        access_key: Option<&str>,
        service: Option<Service>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<UsageDelta> {
        match access_key {
            None => self.account_usage(project_id, service, from, to, now).await,
            Some("") => self.async_usage(project_id, service, from, to, now).await,
            Some(key) => {
                self.access_key_usage(project_id, key, service, from, to, now)
                    .await
            }
        }
    }

    async fn account_usage(
        &self,
        project_id: u64,
        service: Option<Service>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<UsageDelta> {
        let (from, to) = self.get_time_range(project_id, from, to, now).await?;
        self.store
            .usage
            .get_usage(project_id, None, service, from, to)
            .await
    }

    async fn async_usage(
        &self,
        project_id: u64,
        service: Option<Service>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<UsageDelta> {
        let (from, to) = self.get_time_range(project_id, from, to, now).await?;
        self.store
            .usage
            .get_usage(project_id, Some(""), service, from, to)
            .await
    }

    async fn access_key_usage(
        &self,
        project_id: u64,
        access_key: &str,
        service: Option<Service>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<UsageDelta> {
        let key = self.get_access_key(access_key).await?;
        if key.project_id != project_id {
            return Err(QuotaError::AccessKeyMismatch);
        }
        let (from, to) = self.get_time_range(project_id, from, to, now).await?;
        self.store
            .usage
            .get_usage(project_id, Some(access_key), service, from, to)
            .await
    }

    /// Seed the usage counter for `cycle` from stored usage.
    pub async fn prepare_usage(
        &self,
        project_id: u64,
        service: Service,
        cycle: &Cycle,
    ) -> Result<bool> {
        let usage = self
            .store
            .usage
            .get_usage(project_id, None, Some(service), cycle.start, cycle.end)
            .await?;
        let key = CacheKey::Usage {
            service,
            project_id,
            cycle,
        }
        .to_string();
        self.counter.set(&key, usage.total()).await?;
        Ok(true)
    }

    /// Drop the current cycle's counters so the next spend reinitialises them.
    pub async fn clear_usage(
        &self,
        project_id: u64,
        service: Option<Service>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let cycle = self.store.cycles.get_access_cycle(project_id, now).await?;
        let services = match service {
            Some(service) => vec![service],
            None => Service::ALL.to_vec(),
        };
        let mut removed = false;
        for service in services {
            let key = CacheKey::Usage {
                service,
                project_id,
                cycle: &cycle,
            }
            .to_string();
            removed |= self.counter.clear(&key).await?;
        }
        Ok(removed)
    }

    pub async fn get_project_status(
        &self,
        project_id: u64,
        now: DateTime<Utc>,
    ) -> Result<ProjectStatus> {
        let limit = self.store.limits.get_access_limit(project_id).await?;
        let cycle = self.store.cycles.get_access_cycle(project_id, now).await?;
        let mut usage = BTreeMap::new();
        for service in limit.services.keys() {
            let key = CacheKey::Usage {
                service: *service,
                project_id,
                cycle: &cycle,
            }
            .to_string();
            usage.insert(*service, self.counter.get(&key).await?);
        }
        Ok(ProjectStatus {
            project_id,
            limit,
            cycle,
            usage,
        })
    }

    // ------------------------------------------------------------------
    // Limits, cycles and permissions
    // ------------------------------------------------------------------

    pub async fn get_access_limit(&self, project_id: u64) -> Result<Limit> {
        self.store.limits.get_access_limit(project_id).await
    }

    /// Validate and store the limit; creates the project when unknown.
    pub async fn set_access_limit(&self, project_id: u64, limit: &Limit) -> Result<()> {
        limit.validate()?;
        self.store.limits.set_access_limit(project_id, limit).await?;
        self.clear_access_quota_cache(project_id).await?;
        Ok(())
    }

    pub async fn set_access_cycle(&self, project_id: u64, cycle: &Cycle) -> Result<()> {
        self.store.cycles.set_access_cycle(project_id, cycle).await?;
        self.clear_access_quota_cache(project_id).await?;
        Ok(())
    }

    pub async fn set_user_permission(
        &self,
        project_id: u64,
        user_id: &str,
        permission: UserPermission,
    ) -> Result<()> {
        self.store
            .permissions
            .set_user_permission(project_id, user_id, permission)
            .await?;
        if let Err(e) = self.cache.clear_permission(project_id, user_id).await {
            log::warn!("Failed to evict permission {}/{}: {}", project_id, user_id, e);
        }
        Ok(())
    }

    /// Evict every cached descriptor of a project.
    pub async fn clear_access_quota_cache(&self, project_id: u64) -> Result<bool> {
        let keys = self
            .store
            .access_keys
            .list_access_keys(project_id, None, None)
            .await?;
        let names: Vec<&str> = keys.iter().map(|k| k.access_key.as_str()).collect();
        self.evict(project_id, &names).await;
        Ok(true)
    }

    async fn evict(&self, project_id: u64, access_keys: &[&str]) {
        for key in access_keys {
            if let Err(e) = self.cache.clear_access_quota(key).await {
                log::warn!("Failed to evict descriptor for access key {}: {}", key, e);
            }
        }
        if let Err(e) = self.cache.clear_project_quota(project_id).await {
            log::warn!("Failed to evict descriptor for project {}: {}", project_id, e);
        }
    }

    // ------------------------------------------------------------------
    // Access keys
    // ------------------------------------------------------------------

    pub async fn get_access_key(&self, access_key: &str) -> Result<AccessKey> {
        self.store
            .access_keys
            .find_access_key(access_key)
            .await?
            .ok_or(QuotaError::AccessKeyNotFound)
    }

    pub async fn get_default_access_key(&self, project_id: u64) -> Result<AccessKey> {
        self.store
            .access_keys
            .list_access_keys(project_id, Some(true), None)
            .await?
            .into_iter()
            .find(|k| k.is_default)
            .ok_or(QuotaError::NoDefaultKey)
    }

    pub async fn list_access_keys(
        &self,
        project_id: u64,
        active: Option<bool>,
        service: Option<Service>,
    ) -> Result<Vec<AccessKey>> {
        self.store
            .access_keys
            .list_access_keys(project_id, active, service)
            .await
    }

    /// Create a key for an existing project. The first active key becomes
    /// the default.
    pub async fn create_access_key(
        &self,
        project_id: u64,
        settings: NewAccessKey,
        now: DateTime<Utc>,
    ) -> Result<AccessKey> {
        let key = AccessKey {
            access_key: access_key::generate(&self.key_config, project_id),
            project_id,
            display_name: settings.display_name,
            active: true,
            is_default: false,
            require_origin: settings.require_origin,
            allowed_origins: settings.allowed_origins,
            allowed_services: settings.allowed_services,
            created_at: Some(now),
        };
        let key = self.store.access_keys.create_access_key(key).await?;
        self.evict(project_id, &[]).await;

        log::info!(
            "Created access key for project {} (default: {})",
            project_id,
            key.is_default
        );
        Ok(key)
    }

    /// Replace an active key with a fresh one carrying the same settings.
    pub async fn rotate_access_key(
        &self,
        access_key: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessKey> {
        let mut old = self.get_access_key(access_key).await?;
        if !old.active {
            return Err(QuotaError::AccessKeyNotFound);
        }

        let mut new = AccessKey {
            access_key: access_key::generate(&self.key_config, old.project_id),
            is_default: false,
            created_at: Some(now),
            ..old.clone()
        };
        self.store.access_keys.insert_access_key(&new).await?;

        new.is_default = old.is_default;
        old.active = false;
        old.is_default = false;
        self.store
            .access_keys
            .update_access_keys(&[old.clone(), new.clone()])
            .await?;
        self.evict(old.project_id, &[old.access_key.as_str()]).await;

        log::info!("Rotated access key for project {}", old.project_id);
        Ok(new)
    }

    pub async fn update_access_key(
        &self,
        access_key: &str,
        update: AccessKeyUpdate,
    ) -> Result<AccessKey> {
        let mut key = self.get_access_key(access_key).await?;
        if let Some(display_name) = update.display_name {
            key.display_name = display_name;
        }
        if let Some(require_origin) = update.require_origin {
            key.require_origin = require_origin;
        }
        if let Some(allowed_origins) = update.allowed_origins {
            key.allowed_origins = allowed_origins;
        }
        if let Some(allowed_services) = update.allowed_services {
            key.allowed_services = allowed_services;
        }
        self.store
            .access_keys
            .update_access_keys(std::slice::from_ref(&key))
            .await?;
        self.evict(key.project_id, &[access_key]).await;
        Ok(key)
    }

    /// Make `access_key` the project's only default key.
    pub async fn update_default_access_key(
        &self,
        project_id: u64,
        access_key: &str,
    ) -> Result<bool> {
        let key = self.get_access_key(access_key).await?;
        if key.project_id != project_id {
            return Err(QuotaError::AccessKeyMismatch);
        }
        if !key.active {
            return Err(QuotaError::AccessKeyNotFound);
        }

        let mut changed = Vec::new();
        for mut other in self
            .store
            .access_keys
            .list_access_keys(project_id, None, None)
            .await?
        {
            let is_default = other.access_key == access_key;
            if other.is_default != is_default {
                other.is_default = is_default;
                changed.push(other);
            }
        }
        if changed.is_empty() {
            return Ok(true);
        }
        self.store.access_keys.update_access_keys(&changed).await?;

        let names: Vec<&str> = changed.iter().map(|k| k.access_key.as_str()).collect();
        self.evict(project_id, &names).await;
        Ok(true)
    }

    /// Deactivate a key. The last active key cannot be disabled; when the
    /// default goes, the oldest remaining active key takes over.
    pub async fn disable_access_key(&self, access_key: &str) -> Result<bool> {
        let mut key = self.get_access_key(access_key).await?;
        if !key.active {
            return Ok(true);
        }
        let project_id = key.project_id;
        let active = self
            .store
            .access_keys
            .list_access_keys(project_id, Some(true), None)
            .await?;
        if active.len() <= 1 {
            return Err(QuotaError::AtLeastOneKey);
        }

        let mut changed = Vec::with_capacity(2);
        if key.is_default {
            if let Some(mut successor) = active
                .into_iter()
                .find(|k| k.access_key != key.access_key)
            {
                successor.is_default = true;
                changed.push(successor);
            }
        }
        key.active = false;
        key.is_default = false;
        changed.push(key);

        self.store.access_keys.update_access_keys(&changed).await?;
        let names: Vec<&str> = changed.iter().map(|k| k.access_key.as_str()).collect();
        self.evict(project_id, &names).await;

        log::info!("Disabled access key for project {}", project_id);
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Declared but not served
    // ------------------------------------------------------------------

    pub async fn get_project_info(&self, _project_id: u64) -> Result<()> {
        Err(QuotaError::Unimplemented("GetProjectInfo"))
    }

    pub async fn clear_project_info_cache(&self, _project_id: u64) -> Result<bool> {
        Err(QuotaError::Unimplemented("ClearProjectInfoCache"))
    }

    pub async fn get_service_limit(&self, _project_id: u64, _service: Service) -> Result<()> {
        Err(QuotaError::Unimplemented("GetServiceLimit"))
    }

    pub async fn clear_service_limit_cache(&self, _project_id: u64) -> Result<bool> {
        Err(QuotaError::Unimplemented("ClearServiceLimitCache"))
    }
}

#[async_trait]
impl QuotaControl for Authority {
    async fn get_access_quota(&self, access_key: &str, now: DateTime<Utc>) -> Result<AccessQuota> {
        let key = self.get_access_key(access_key).await?;
        let project_id = key.project_id;
        let limit = self.store.limits.get_access_limit(project_id).await?;
        let cycle = self.store.cycles.get_access_cycle(project_id, now).await?;

        let quota = AccessQuota {
            project_id,
            access_key: Some(key),
            limit,
            cycle,
        };
        if let Err(e) = self.cache.set_quota(&quota).await {
            log::warn!("Failed to cache descriptor for project {}: {}", project_id, e);
        }
        Ok(quota)
    }

    async fn get_project_quota(&self, project_id: u64, now: DateTime<Utc>) -> Result<AccessQuota> {
        let limit = self.store.limits.get_access_limit(project_id).await?;
        let cycle = self.store.cycles.get_access_cycle(project_id, now).await?;

        let quota = AccessQuota {
            project_id,
            access_key: None,
            limit,
            cycle,
        };
        if let Err(e) = self.cache.set_quota(&quota).await {
            log::warn!("Failed to cache descriptor for project {}: {}", project_id, e);
        }
        Ok(quota)
    }

    async fn get_account_usage(
        &self,
        project_id: u64,
        service: Option<Service>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<UsageDelta> {
        self.account_usage(project_id, service, from, to, Utc::now())
            .await
    }

    async fn notify_event(
        &self,
        project_id: u64,
        service: Service,
        event: EventType,
    ) -> Result<bool> {
        log::info!(
            "Quota event {} for project {} on {}",
            event,
            project_id,
            service
        );
        Ok(true)
    }

    async fn update_key_usage(
        &self,
        service: Service,
        bucket: DateTime<Utc>,
        usage: HashMap<String, UsageDelta>,
    ) -> Result<HashMap<String, bool>> {
        let mut accepted = HashMap::with_capacity(usage.len());
        for (key, delta) in usage {
            let project_id = match access_key::project_id(&key) {
                Ok(id) => id,
                Err(e) => {
                    log::warn!("Dropping usage for undecodable access key: {}", e);
                    accepted.insert(key, false);
                    continue;
                }
            };
            let ok = match self
                .store
                .usage
                .insert_usage(project_id, &key, service, bucket, delta)
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Failed to store usage for project {}: {}", project_id, e);
                    false
                }
            };
            accepted.insert(key, ok);
        }
        Ok(accepted)
    }

    async fn update_project_usage(
        &self,
        service: Service,
        bucket: DateTime<Utc>,
        usage: HashMap<u64, UsageDelta>,
    ) -> Result<HashMap<u64, bool>> {
        let mut accepted = HashMap::with_capacity(usage.len());
        for (project_id, delta) in usage {
            let ok = match self
                .store
                .usage
                .insert_usage(project_id, "", service, bucket, delta)
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Failed to store usage for project {}: {}", project_id, e);
                    false
                }
            };
            accepted.insert(project_id, ok);
        }
        Ok(accepted)
    }

    async fn get_user_permission(
        &self,
        project_id: u64,
        user_id: &str,
    ) -> Result<UserPermission> {
        // Store faults propagate so callers can tell an outage from a
        // missing grant. Missing grants are not cached.
        let permission = self
            .store
            .permissions
            .get_user_permission(project_id, user_id)
            .await?;
        if permission != UserPermission::Unauthorized {
            if let Err(e) = self
                .cache
                .set_permission(project_id, user_id, permission)
                .await
            {
                log::warn!("Failed to cache permission {}/{}: {}", project_id, user_id, e);
            }
        }
        Ok(permission)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Backend, MemoryBackend, SharedCache};
    use crate::model::ServiceLimit;
    use access_key::Version;
    use chrono::TimeZone;
    use std::time::Duration;

    struct Fixture {
        authority: Authority,
        backend: Arc<MemoryBackend>,
        now: DateTime<Utc>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let cache = Arc::new(QuotaCache::new(
            SharedCache::new(backend.clone(), Duration::from_secs(60)),
            100,
            Duration::from_secs(60),
        ));
        let counter = Arc::new(UsageCounter::new(backend.clone(), Duration::from_secs(3600)));
        let store = Store::sqlite(Arc::new(SqliteStore::open_in_memory().unwrap()));
        Fixture {
            authority: Authority::new(store, cache, counter, AccessKeyConfig::new(Version::V2)),
            backend,
            now: Utc.with_ymd_and_hms(2024, 6, 12, 8, 30, 0).unwrap(),
        }
    }

    fn limit(max_keys: i64) -> Limit {
        Limit {
            max_keys,
            ..Limit::default()
        }
        .with_service(
            Service::API,
            ServiceLimit {
                rate_limit: 100,
                free_warn: 0,
                free_max: 5,
                over_warn: 0,
                over_max: 10,
            },
        )
    }

    async fn defaults(authority: &Authority, project_id: u64) -> usize {
        authority
            .list_access_keys(project_id, Some(true), None)
            .await
            .unwrap()
            .iter()
            .filter(|k| k.is_default)
            .count()
    }

    #[tokio::test]
    async fn test_create_requires_project() {
        let f = fixture();
        let err = f
            .authority
            .create_access_key(1, NewAccessKey::default(), f.now)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::ProjectNotFound));
    }

    #[tokio::test]
    async fn test_first_key_is_default_and_max_keys_enforced() {
        let f = fixture();
        f.authority.set_access_limit(1, &limit(2)).await.unwrap();

        let k1 = f
            .authority
            .create_access_key(1, NewAccessKey::default(), f.now)
            .await
            .unwrap();
        let k2 = f
            .authority
            .create_access_key(1, NewAccessKey::default(), f.now)
            .await
            .unwrap();
        assert!(k1.is_default);
        assert!(!k2.is_default);
        assert_eq!(access_key::project_id(&k1.access_key).unwrap(), 1);

        let err = f
            .authority
            .create_access_key(1, NewAccessKey::default(), f.now)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::MaxAccessKeys));
    }

    #[tokio::test]
    async fn test_disable_last_key_then_promote() {
        let f = fixture();
        f.authority.set_access_limit(1, &limit(0)).await.unwrap();
        let k1 = f
            .authority
            .create_access_key(1, NewAccessKey::default(), f.now)
            .await
            .unwrap();

        let err = f
            .authority
            .disable_access_key(&k1.access_key)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::AtLeastOneKey));

        let k2 = f
            .authority
            .create_access_key(1, NewAccessKey::default(), f.now)
            .await
            .unwrap();
        assert!(f.authority.disable_access_key(&k1.access_key).await.unwrap());

        let default = f.authority.get_default_access_key(1).await.unwrap();
        assert_eq!(default.access_key, k2.access_key);
        assert!(!f.authority.get_access_key(&k1.access_key).await.unwrap().active);
        assert_eq!(defaults(&f.authority, 1).await, 1);
    }

    #[tokio::test]
    async fn test_rotate_carries_default_and_settings() {
        let f = fixture();
        f.authority.set_access_limit(1, &limit(0)).await.unwrap();
        let settings = NewAccessKey {
            display_name: "web".to_string(),
            require_origin: true,
            allowed_origins: vec!["https://*.example.com".to_string()],
            allowed_services: vec![Service::API],
        };
        let old = f
            .authority
            .create_access_key(1, settings, f.now)
            .await
            .unwrap();

        let new = f
            .authority
            .rotate_access_key(&old.access_key, f.now)
            .await
            .unwrap();
        assert_ne!(new.access_key, old.access_key);
        assert!(new.is_default);
        assert_eq!(new.display_name, "web");
        assert_eq!(new.allowed_origins, old.allowed_origins);

        let old = f.authority.get_access_key(&old.access_key).await.unwrap();
        assert!(!old.active && !old.is_default);
        assert_eq!(defaults(&f.authority, 1).await, 1);
    }

    #[tokio::test]
    async fn test_set_default_checks_project() {
        let f = fixture();
        f.authority.set_access_limit(1, &limit(0)).await.unwrap();
        f.authority.set_access_limit(2, &limit(0)).await.unwrap();
        let _k1 = f
            .authority
            .create_access_key(1, NewAccessKey::default(), f.now)
            .await
            .unwrap();
        let k2 = f
            .authority
            .create_access_key(1, NewAccessKey::default(), f.now)
            .await
            .unwrap();
        let foreign = f
            .authority
            .create_access_key(2, NewAccessKey::default(), f.now)
            .await
            .unwrap();

        let err = f
            .authority
            .update_default_access_key(1, &foreign.access_key)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::AccessKeyMismatch));

        f.authority
            .update_default_access_key(1, &k2.access_key)
            .await
            .unwrap();
        assert_eq!(
            f.authority.get_default_access_key(1).await.unwrap().access_key,
            k2.access_key
        );
        assert_eq!(defaults(&f.authority, 1).await, 1);
    }

    #[tokio::test]
    async fn test_mutation_evicts_descriptor() {
        let f = fixture();
        f.authority.set_access_limit(1, &limit(0)).await.unwrap();
        let key = f
            .authority
            .create_access_key(1, NewAccessKey::default(), f.now)
            .await
            .unwrap();

        f.authority
            .get_access_quota(&key.access_key, f.now)
            .await
            .unwrap();
        let cache_key = CacheKey::AccessQuota(&key.access_key).to_string();
        assert!(f.backend.get(&cache_key).await.unwrap().is_some());

        f.authority
            .update_access_key(
                &key.access_key,
                AccessKeyUpdate {
                    display_name: Some("renamed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(f.backend.get(&cache_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_usage_dispatch() {
        let f = fixture();
        f.authority.set_access_limit(1, &limit(0)).await.unwrap();
        let key = f
            .authority
            .create_access_key(1, NewAccessKey::default(), f.now)
            .await
            .unwrap();

        let accepted = f
            .authority
            .update_key_usage(
                Service::API,
                f.now,
                HashMap::from([
                    (key.access_key.clone(), UsageDelta::valid(3)),
                    ("garbage".to_string(), UsageDelta::valid(1)),
                ]),
            )
            .await
            .unwrap();
        assert!(accepted[&key.access_key]);
        assert!(!accepted["garbage"]);

        f.authority
            .update_project_usage(Service::API, f.now, HashMap::from([(1, UsageDelta::valid(2))]))
            .await
            .unwrap();

        let total = f
            .authority
            .get_usage(1, None, None, None, None, f.now)
            .await
            .unwrap();
        assert_eq!(total, UsageDelta::valid(5));
        let rollup = f
            .authority
            .get_usage(1, Some(""), None, None, None, f.now)
            .await
            .unwrap();
        assert_eq!(rollup, UsageDelta::valid(2));
        let per_key = f
            .authority
            .get_usage(1, Some(&key.access_key), None, None, None, f.now)
            .await
            .unwrap();
        assert_eq!(per_key, UsageDelta::valid(3));
    }

    #[tokio::test]
    async fn test_prepare_and_clear_usage() {
        let f = fixture();
        f.authority.set_access_limit(1, &limit(0)).await.unwrap();
        f.authority
            .update_project_usage(Service::API, f.now, HashMap::from([(1, UsageDelta::valid(4))]))
            .await
            .unwrap();

        let cycle = Cycle::for_time(f.now);
        assert!(f.authority.prepare_usage(1, Service::API, &cycle).await.unwrap());
        let status = f.authority.get_project_status(1, f.now).await.unwrap();
        assert_eq!(status.usage[&Service::API], Some(4));

        assert!(f.authority.clear_usage(1, Some(Service::API), f.now).await.unwrap());
        let status = f.authority.get_project_status(1, f.now).await.unwrap();
        assert_eq!(status.usage[&Service::API], None);
    }

    #[tokio::test]
    async fn test_invalid_limit_rejected() {
        let f = fixture();
        let bad = Limit::default().with_service(
            Service::API,
            ServiceLimit {
                rate_limit: 1,
                free_warn: 0,
                free_max: 10,
                over_warn: 0,
                over_max: 5,
            },
        );
        assert!(matches!(
            f.authority.set_access_limit(1, &bad).await,
            Err(QuotaError::InvalidLimit(_))
        ));
    }

    #[tokio::test]
    async fn test_unimplemented_endpoints() {
        let f = fixture();
        assert!(matches!(
            f.authority.get_project_info(1).await,
            Err(QuotaError::Unimplemented("GetProjectInfo"))
        ));
        assert!(matches!(
            f.authority.clear_service_limit_cache(1).await,
            Err(QuotaError::Unimplemented(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_creates_keep_one_default() {
        let f = fixture();
        f.authority.set_access_limit(1, &limit(3)).await.unwrap();
        let authority = Arc::new(f.authority);

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let authority = authority.clone();
            let now = f.now;
            tasks.push(tokio::spawn(async move {
                authority
                    .create_access_key(1, NewAccessKey::default(), now)
                    .await
            }));
        }
        let (mut created, mut full) = (0, 0);
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => created += 1,
                Err(QuotaError::MaxAccessKeys) => full += 1,
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert_eq!((created, full), (3, 7));
        assert_eq!(defaults(&authority, 1).await, 1);
    }

    struct DownPermissions;

    #[async_trait]
    impl PermissionStore for DownPermissions {
        async fn get_user_permission(&self, _: u64, _: &str) -> Result<UserPermission> {
            Err(QuotaError::Store(rusqlite::Error::InvalidQuery))
        }

        async fn set_user_permission(&self, _: u64, _: &str, _: UserPermission) -> Result<()> {
            Err(QuotaError::Store(rusqlite::Error::InvalidQuery))
        }
    }

    #[tokio::test]
    async fn test_permission_outage_is_transient_and_uncached() {
        let mut f = fixture();
        f.authority.store.permissions = Arc::new(DownPermissions);

        let err = f
            .authority
            .get_user_permission(1, "dev")
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(
            f.authority.cache.get_permission(1, "dev").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_permission_lookup_caches_grants_only() {
        let f = fixture();
        assert_eq!(
            f.authority.get_user_permission(1, "dev").await.unwrap(),
            UserPermission::Unauthorized
        );
        assert_eq!(
            f.authority.cache.get_permission(1, "dev").await.unwrap(),
            None
        );

        f.authority
            .set_user_permission(1, "dev", UserPermission::Read)
            .await
            .unwrap();
        assert_eq!(
            f.authority.get_user_permission(1, "dev").await.unwrap(),
            UserPermission::Read
        );
        assert_eq!(
            f.authority.cache.get_permission(1, "dev").await.unwrap(),
            Some(UserPermission::Read)
        );
    }
}
