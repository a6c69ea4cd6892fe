//! Request-time quota facade used by the middleware.
//!
//! The client resolves descriptors through the two-level cache, spends compute
//! units against the distributed counter and accumulates classified usage for
//! the background sync. Infrastructure faults never reject a request: they are
//! logged and the request proceeds.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pingora::services::background::BackgroundService;
use tokio::sync::Notify;

use crate::authority::QuotaControl;
use crate::cache::{CacheKey, QuotaCache, UsageCounter};
use crate::configuration::Config;
use crate::error::{QuotaError, Result};
use crate::model::{AccessQuota, Cycle, EventType, Service, UsageDelta, UserPermission};
use crate::usage::{SyncReport, UsageTracker};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const STOPPED: u8 = 3;

/// Lifecycle of the sync loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Result of [`QuotaClient::spend_quota`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendOutcome {
    /// Nothing to spend: zero cost or no limit for this service.
    Skipped,
    /// The whole cost was spent; `total` is the counter afterwards.
    Spent { total: i64 },
    /// The hard limit was hit.
    Exceeded { total: i64 },
    /// The counter could not be reached; usage was recorded as free.
    Unverified,
}

// ============================================================================
// Fetch coalescing
// ============================================================================

/// Per-key gates so concurrent misses for one descriptor make a single
/// authority call.
#[derive(Default)]
struct FetchGates {
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FetchGates {
    fn enter(&self, key: &str) -> GatePass<'_> {
        let gate = self
            .gates
            .lock()
            .expect("fetch gates poisoned")
            .entry(key.to_string())
            .or_default()
            .clone();
        GatePass {
            gates: self,
            key: key.to_string(),
            gate,
        }
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.gates.lock().expect("fetch gates poisoned").is_empty()
    }
}

/// A caller's hold on a key's gate. The last holder to leave removes the
/// gate, whether it finished, failed or was cancelled.
struct GatePass<'a> {
    gates: &'a FetchGates,
    key: String,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        let mut gates = self.gates.gates.lock().expect("fetch gates poisoned");
        let last = gates
            .get(&self.key)
            .is_some_and(|current| {
                Arc::ptr_eq(current, &self.gate) && Arc::strong_count(&self.gate) <= 2
            });
        if last {
            gates.remove(&self.key);
        }
    }
}

// ============================================================================
// Quota Client
// ============================================================================

pub struct QuotaClient {
    service: Service,
    config: Config,
    authority: Arc<dyn QuotaControl>,
    cache: Arc<QuotaCache>,
    counter: Arc<UsageCounter>,
    tracker: UsageTracker,
    gates: FetchGates,
    /// `(project, event)` to the end of the cycle it was sent for.
    notified: Mutex<HashMap<(u64, EventType), DateTime<Utc>>>,
    state: AtomicU8,
    shutdown: Notify,
}

impl QuotaClient {
    pub fn new(
        config: Config,
        service: Service,
        cache: Arc<QuotaCache>,
        counter: Arc<UsageCounter>,
        authority: Arc<dyn QuotaControl>,
    ) -> Self {
        Self {
            service,
            config,
            authority,
            cache,
            counter,
            tracker: UsageTracker::new(),
            gates: FetchGates::default(),
            notified: Mutex::new(HashMap::new()),
            state: AtomicU8::new(IDLE),
            shutdown: Notify::new(),
        }
    }

    pub fn service(&self) -> Service {
        self.service
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Cost of a request that does not declare one.
    pub fn get_default_usage(&self) -> i64 {
        self.config.default_usage
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tracker(&self) -> &UsageTracker {
        &self.tracker
    }

    pub fn state(&self) -> ClientState {
        match self.state.load(Ordering::Acquire) {
            IDLE => ClientState::Idle,
            RUNNING => ClientState::Running,
            STOPPING => ClientState::Stopping,
            _ => ClientState::Stopped,
        }
    }

    // ------------------------------------------------------------------
    // Descriptors
    // ------------------------------------------------------------------

    /// Descriptor for an access key, validated for this request.
    ///
    /// Returns `Ok(None)` when the descriptor is unavailable for
    /// infrastructure reasons; only `AccessKeyNotFound`, `ProjectNotFound`,
    /// `InvalidOrigin` and `InvalidService` reject.
    pub async fn fetch_key_quota(
        &self,
        access_key: &str,
        origin: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AccessQuota>> {
        let quota = match self.cache.get_access_quota(access_key).await {
            Ok(Some(quota)) => quota,
            Ok(None) => {
                let gate_key = CacheKey::AccessQuota(access_key).to_string();
                let fetched = self
                    .coalesced(&gate_key, || self.cache.get_access_quota(access_key), || {
                        self.authority.get_access_quota(access_key, now)
                    })
                    .await?;
                match fetched {
                    Some(quota) => quota,
                    None => return Ok(None),
                }
            }
            Err(e) => {
                log::warn!("fetch_key_quota: cache unavailable: {}", e);
                return Ok(None);
            }
        };

        let Some(key) = &quota.access_key else {
            return Err(QuotaError::AccessKeyNotFound);
        };
        if !key.active {
            return Err(QuotaError::AccessKeyNotFound);
        }
        if !key.validate_origin(origin) {
            return Err(QuotaError::InvalidOrigin);
        }
        if !key.validate_service(self.service) {
            return Err(QuotaError::InvalidService);
        }
        Ok(Some(quota))
    }

    /// Descriptor for a project-scoped caller.
    pub async fn fetch_project_quota(
        &self,
        project_id: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<AccessQuota>> {
        match self.cache.get_project_quota(project_id).await {
            Ok(Some(quota)) => Ok(Some(quota)),
            Ok(None) => {
                let gate_key = CacheKey::ProjectQuota(project_id).to_string();
                self.coalesced(&gate_key, || self.cache.get_project_quota(project_id), || {
                    self.authority.get_project_quota(project_id, now)
                })
                .await
            }
            Err(e) => {
                log::warn!("fetch_project_quota: cache unavailable: {}", e);
                Ok(None)
            }
        }
    }

    /// Run `fetch` once per key across concurrent callers.
    ///
    /// Waiters re-check the cache after the gate opens. Authority lookups
    /// that fail with anything but a missing key or project yield `None`.
    async fn coalesced<C, CF, F, FF>(
        &self,
        gate_key: &str,
        cached: C,
        fetch: F,
    ) -> Result<Option<AccessQuota>>
    where
        C: FnOnce() -> CF,
        CF: Future<Output = Result<Option<AccessQuota>>>,
        F: FnOnce() -> FF,
        FF: Future<Output = Result<AccessQuota>>,
    {
        let pass = self.gates.enter(gate_key);
        let _guard = pass.gate.lock().await;

        if let Ok(Some(quota)) = cached().await {
            return Ok(Some(quota));
        }

        match fetch().await {
            Ok(quota) => {
                if let Err(e) = self.cache.set_quota(&quota).await {
                    log::warn!("Failed to cache descriptor {}: {}", gate_key, e);
                }
                Ok(Some(quota))
            }
            Err(e @ (QuotaError::AccessKeyNotFound | QuotaError::ProjectNotFound)) => Err(e),
            Err(e) => {
                log::warn!("Authority lookup for {} failed: {}", gate_key, e);
                Ok(None)
            }
        }
    }

    // ------------------------------------------------------------------
    // Usage
    // ------------------------------------------------------------------

    fn usage_key(&self, quota: &AccessQuota, cycle: &Cycle) -> String {
        CacheKey::Usage {
            service: self.service,
            project_id: quota.project_id,
            cycle,
        }
        .to_string()
    }

    fn usage_fetcher<'a>(
        &'a self,
        project_id: u64,
        cycle: Cycle,
    ) -> impl FnOnce() -> Pin<Box<dyn Future<Output = Result<i64>> + Send + 'a>> + 'a {
        move || {
            Box::pin(async move {
                let usage = self
                    .authority
                    .get_account_usage(
                        project_id,
                        Some(self.service),
                        Some(cycle.start),
                        Some(cycle.end),
                    )
                    .await?;
                Ok(usage.total())
            })
        }
    }

    /// Current counter value for the descriptor's cycle at `now`.
    pub async fn fetch_usage(&self, quota: &AccessQuota, now: DateTime<Utc>) -> Result<i64> {
        let cycle = quota.cycle.resolve(now);
        let key = self.usage_key(quota, &cycle);
        self.counter
            .peek(&key, self.usage_fetcher(quota.project_id, cycle))
            .await
    }

    /// Spend `cost` units and record the classified usage.
    pub async fn spend_quota(
        &self,
        quota: &AccessQuota,
        cost: i64,
        now: DateTime<Utc>,
    ) -> Result<SpendOutcome> {
        if cost <= 0 {
            return Ok(SpendOutcome::Skipped);
        }
        let Some(limit) = quota.limit.service(self.service).copied() else {
            log::debug!(
                "Project {} has no {} limit, not spending",
                quota.project_id,
                self.service
            );
            return Ok(SpendOutcome::Skipped);
        };

        let cycle = quota.cycle.resolve(now);
        let key = self.usage_key(quota, &cycle);
        let spent = self
            .counter
            .spend(
                &key,
                self.usage_fetcher(quota.project_id, cycle),
                cost,
                limit.over_max,
            )
            .await;

        let (total, spent) = match spent {
            Ok(result) => result,
            Err(e) if e.is_transient() => {
                log::warn!("spend_quota: counter {} unavailable: {}", key, e);
                self.record_usage(quota, now, UsageDelta::valid(cost));
                return Ok(SpendOutcome::Unverified);
            }
            Err(e) => return Err(e),
        };

        if spent < cost {
            self.record_usage(quota, now, UsageDelta::limited(cost));
            let (_, event) = limit.spend_result(spent, total);
            if let Some(event) = event {
                self.notify(quota.project_id, event, &cycle).await;
            }
            return Ok(SpendOutcome::Exceeded { total });
        }

        let (delta, event) = limit.spend_result(cost, total);
        self.record_usage(quota, now, delta);
        if let Some(event) = event {
            self.notify(quota.project_id, event, &cycle).await;
        }
        Ok(SpendOutcome::Spent { total })
    }

    fn record_usage(&self, quota: &AccessQuota, now: DateTime<Utc>, delta: UsageDelta) {
        match &quota.access_key {
            Some(key) => self.tracker.add_key_usage(&key.access_key, now, delta),
            None => self.tracker.add_project_usage(quota.project_id, now, delta),
        }
    }

    /// Send `event` unless it was already sent for this cycle.
    async fn notify(&self, project_id: u64, event: EventType, cycle: &Cycle) {
        {
            let mut notified = self.notified.lock().expect("notified events poisoned");
            notified.retain(|_, end| *end > cycle.start);
            if notified.get(&(project_id, event)) == Some(&cycle.end) {
                return;
            }
            notified.insert((project_id, event), cycle.end);
        }

        match self
            .authority
            .notify_event(project_id, self.service, event)
            .await
        {
            Ok(_) => {}
            Err(e) => {
                log::warn!(
                    "Failed to notify {} for project {}: {}",
                    event,
                    project_id,
                    e
                );
                self.notified.lock().expect("notified events poisoned").remove(&(project_id, event));
            }
        }
    }

    // ------------------------------------------------------------------
    // Permissions
    // ------------------------------------------------------------------

    /// Whether `user_id` holds at least `min` on the project.
    pub async fn check_permission(
        &self,
        project_id: u64,
        user_id: &str,
        min: UserPermission,
    ) -> Result<bool> {
        let permission = match self.cache.get_permission(project_id, user_id).await {
            Ok(Some(permission)) => permission,
            Ok(None) => {
                self.authority
                    .get_user_permission(project_id, user_id)
                    .await?
            }
            Err(e) => {
                log::warn!("check_permission: cache unavailable: {}", e);
                self.authority
                    .get_user_permission(project_id, user_id)
                    .await?
            }
        };
        Ok(permission >= min)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Push tracked usage to the authority.
    pub async fn sync_usage(&self) -> Result<SyncReport> {
        self.tracker
            .sync_usage(self.authority.as_ref(), self.service)
            .await
    }

    /// Run the sync ticker until [`stop`](Self::stop) is called.
    pub async fn run(&self) -> Result<()> {
        self.state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| QuotaError::Config("quota client already started".to_string()))?;

        log::info!(
            "Quota client for {} syncing every {:?}",
            self.service,
            self.config.update_freq
        );

        let mut ticker = tokio::time::interval(self.config.update_freq);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => return Ok(()),
                _ = ticker.tick() => {
                    match self.sync_usage().await {
                        Ok(report) if report.accepted > 0 => {
                            log::info!("Synced {} usage entries", report.accepted);
                        }
                        Ok(_) => {}
                        Err(e) => log::error!("Usage sync failed: {}", e),
                    }
                }
            }
        }
    }

    /// Stop the ticker and flush usage, waiting at most `deadline`.
    ///
    /// Calling it again, or on a client that never ran, is a no-op.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        if self
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        self.shutdown.notify_one();

        let result = match tokio::time::timeout(deadline, self.sync_usage()).await {
            Ok(Ok(report)) => {
                log::info!("Final usage sync: {} entries", report.accepted);
                Ok(())
            }
            Ok(Err(e)) => {
                log::error!("Final usage sync failed: {}", e);
                Err(e)
            }
            Err(_) => {
                log::error!("Final usage sync timed out after {:?}", deadline);
                Err(QuotaError::Timeout)
            }
        };
        self.state.store(STOPPED, Ordering::Release);
        result
    }
}

// ============================================================================
// Background sync service
// ============================================================================

/// Runs the client's sync loop inside the pingora server.
pub struct UsageSyncService {
    client: Arc<QuotaClient>,
    deadline: Duration,
}

impl UsageSyncService {
    pub fn new(client: Arc<QuotaClient>, deadline: Duration) -> Self {
        Self { client, deadline }
    }
}

#[async_trait]
impl BackgroundService for UsageSyncService {
    async fn start(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let run = self.client.run();
        tokio::pin!(run);

        let exited = tokio::select! {
            result = &mut run => Some(result),
            _ = shutdown.changed() => None,
        };
        let (stopped, ran) = match exited {
            Some(ran) => (self.client.stop(self.deadline).await, Ok(ran)),
            // Keep polling the loop so a sync already in flight completes
            // next to the final flush.
            None => tokio::join!(
                self.client.stop(self.deadline),
                tokio::time::timeout(self.deadline, &mut run)
            ),
        };

        match ran {
            Ok(Err(e)) => log::error!("Usage sync loop exited: {}", e),
            Err(_) => log::warn!("Usage sync loop still busy after {:?}", self.deadline),
            Ok(Ok(())) => {}
        }
        if let Err(e) = stopped {
            log::error!("Failed to stop quota client: {}", e);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
