//! Persistence contracts used by the authority.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{AccessKey, Cycle, Limit, Service, UsageDelta, UserPermission};

use super::sqlite::SqliteStore;

#[async_trait]
pub trait AccessKeyStore: Send + Sync {
    async fn find_access_key(&self, access_key: &str) -> Result<Option<AccessKey>>;

    /// Keys of a project ordered by creation time, oldest first.
    ///
    /// `active` and `service` narrow the result when set; a key with no
    /// allowed services matches every service.
    async fn list_access_keys(
        &self,
        project_id: u64,
        active: Option<bool>,
        service: Option<Service>,
    ) -> Result<Vec<AccessKey>>;

    async fn insert_access_key(&self, access_key: &AccessKey) -> Result<()>;

    /// Insert a new active key, making it the default when the project has
    /// no other active key.
    ///
    /// Fails with `ProjectNotFound` for unknown projects and `MaxAccessKeys`
    /// when the project is full. The check and the insert are atomic.
    async fn create_access_key(&self, access_key: AccessKey) -> Result<AccessKey>;

    /// Write every key in one transaction.
    async fn update_access_keys(&self, access_keys: &[AccessKey]) -> Result<()>;
}

#[async_trait]
pub trait LimitStore: Send + Sync {
    /// Fails with `ProjectNotFound` for unknown projects.
    async fn get_access_limit(&self, project_id: u64) -> Result<Limit>;

    async fn set_access_limit(&self, project_id: u64, limit: &Limit) -> Result<()>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Add `delta` to the row for `(project, access_key, service, bucket)`.
    ///
    /// Project-level usage is stored under the empty access key.
    async fn insert_usage(
        &self,
        project_id: u64,
        access_key: &str,
        service: Service,
        bucket: DateTime<Utc>,
        delta: UsageDelta,
    ) -> Result<()>;

    /// Sum usage in `[from, to)`. `access_key = None` sums every row of the
    /// project; `service = None` sums every service.
    async fn get_usage(
        &self,
        project_id: u64,
        access_key: Option<&str>,
        service: Option<Service>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<UsageDelta>;
}

#[async_trait]
pub trait CycleStore: Send + Sync {
    /// The project's cycle containing `now`, the calendar month unless
    /// overridden.
    async fn get_access_cycle(&self, project_id: u64, now: DateTime<Utc>) -> Result<Cycle>;

    async fn set_access_cycle(&self, project_id: u64, cycle: &Cycle) -> Result<()>;
}

#[async_trait]
pub trait PermissionStore: Send + Sync {
    /// `Unauthorized` when the user has no grant.
    async fn get_user_permission(&self, project_id: u64, user_id: &str)
    -> Result<UserPermission>;

    async fn set_user_permission(
        &self,
        project_id: u64,
        user_id: &str,
        permission: UserPermission,
    ) -> Result<()>;
}

/// The full set of stores an [`Authority`](super::Authority) runs on.
#[derive(Clone)]
pub struct Store {
    pub access_keys: Arc<dyn AccessKeyStore>,
    pub limits: Arc<dyn LimitStore>,
    pub usage: Arc<dyn UsageStore>,
    pub cycles: Arc<dyn CycleStore>,
    pub permissions: Arc<dyn PermissionStore>,
}

impl Store {
    /// Every store backed by the same SQLite database.
    pub fn sqlite(store: Arc<SqliteStore>) -> Self {
        Self {
            access_keys: store.clone(),
            limits: store.clone(),
            usage: store.clone(),
            cycles: store.clone(),
            permissions: store,
        }
    }
}
