use std::time::Duration;

use super::{CacheKey, LruCache, SharedCache};
use crate::error::Result;
use crate::model::{AccessQuota, UserPermission};

/// Descriptor and permission caches shared by the client and the authority.
///
/// The client reads and fills it on the request path; the authority writes
/// fresh descriptors and evicts them on mutation.
pub struct QuotaCache {
    access_quota: LruCache<AccessQuota>,
    project_quota: LruCache<AccessQuota>,
    permissions: LruCache<UserPermission>,
}

impl QuotaCache {
    pub fn new(shared: SharedCache, lru_size: usize, lru_expiration: Duration) -> Self {
        Self {
            access_quota: LruCache::new(Some(shared.clone()), lru_size, lru_expiration),
            project_quota: LruCache::new(Some(shared.clone()), lru_size, lru_expiration),
            permissions: LruCache::new(Some(shared), lru_size, lru_expiration),
        }
    }

    pub async fn get_access_quota(&self, access_key: &str) -> Result<Option<AccessQuota>> {
        self.access_quota
            .get(&CacheKey::AccessQuota(access_key).to_string())
            .await
    }

    /// Stores under the access key, or the project id for project quotas.
    pub async fn set_quota(&self, quota: &AccessQuota) -> Result<()> {
        match &quota.access_key {
            Some(key) => {
                self.access_quota
                    .set(&CacheKey::AccessQuota(&key.access_key).to_string(), quota)
                    .await
            }
            None => {
                self.project_quota
                    .set(&CacheKey::ProjectQuota(quota.project_id).to_string(), quota)
                    .await
            }
        }
    }

    pub async fn clear_access_quota(&self, access_key: &str) -> Result<bool> {
        self.access_quota
            .clear(&CacheKey::AccessQuota(access_key).to_string())
            .await
    }

    pub async fn get_project_quota(&self, project_id: u64) -> Result<Option<AccessQuota>> {
        self.project_quota
            .get(&CacheKey::ProjectQuota(project_id).to_string())
            .await
    }

    pub async fn clear_project_quota(&self, project_id: u64) -> Result<bool> {
        self.project_quota
            .clear(&CacheKey::ProjectQuota(project_id).to_string())
            .await
    }

    pub async fn get_permission(
        &self,
        project_id: u64,
        user_id: &str,
    ) -> Result<Option<UserPermission>> {
        self.permissions
            .get(&CacheKey::Permission { project_id, user_id }.to_string())
            .await
    }

    pub async fn set_permission(
        &self,
        project_id: u64,
        user_id: &str,
        permission: UserPermission,
    ) -> Result<()> {
        self.permissions
            .set(&CacheKey::Permission { project_id, user_id }.to_string(), &permission)
            .await
    }

    pub async fn clear_permission(&self, project_id: u64, user_id: &str) -> Result<bool> {
        self.permissions
            .clear(&CacheKey::Permission { project_id, user_id }.to_string())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Backend, MemoryBackend};
    use crate::model::{Cycle, Limit};
    use chrono::Utc;
    use std::sync::Arc;

    fn quota(project_id: u64) -> AccessQuota {
        AccessQuota {
            project_id,
            access_key: None,
            limit: Limit::default(),
            cycle: Cycle::for_time(Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_project_quota_uses_project_key() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = QuotaCache::new(
            SharedCache::new(backend.clone(), Duration::from_secs(60)),
            10,
            Duration::from_secs(60),
        );
        cache.set_quota(&quota(5)).await.unwrap();
        assert!(backend.get("project:v2:5").await.unwrap().is_some());
        assert_eq!(cache.get_project_quota(5).await.unwrap(), Some(quota(5)));
        assert!(cache.clear_project_quota(5).await.unwrap());
        assert_eq!(cache.get_project_quota(5).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_permissions_round_trip() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = QuotaCache::new(
            SharedCache::new(backend.clone(), Duration::from_secs(60)),
            10,
            Duration::from_secs(60),
        );
        cache.set_permission(1, "alice", UserPermission::ReadWrite).await.unwrap();
        assert!(backend.get("perm:v2:1:alice").await.unwrap().is_some());
        assert_eq!(
            cache.get_permission(1, "alice").await.unwrap(),
            Some(UserPermission::ReadWrite)
        );
        assert!(cache.clear_permission(1, "alice").await.unwrap());
    }
}
