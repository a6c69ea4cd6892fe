//! Per-node usage accumulation with minute-level granularity.
//!
//! Every spend is classified into a [`UsageDelta`] and added to a bucket keyed
//! by the minute it happened in. Buckets are periodically handed to the
//! authority; entries it does not acknowledge are merged back so the next sync
//! retries them.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};

use crate::authority::QuotaControl;
use crate::error::Result;
use crate::model::{Service, UsageDelta};

// ============================================================================
// Data Structures
// ============================================================================

/// Usage accumulated in a single minute bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageRecord {
    /// Usage attributed to access keys.
    pub by_access_key: HashMap<String, UsageDelta>,
    /// Usage of project-scoped callers with no access key.
    pub by_project: HashMap<u64, UsageDelta>,
}

impl UsageRecord {
    pub fn is_empty(&self) -> bool {
        self.by_access_key.is_empty() && self.by_project.is_empty()
    }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Entries acknowledged by the authority.
    pub accepted: usize,
    /// Entries merged back for the next pass.
    pub retried: usize,
}

/// Truncate to the start of the minute.
pub fn minute_bucket(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(TimeDelta::minutes(1)).unwrap_or(at)
}

// ============================================================================
// Usage Tracker
// ============================================================================

/// Thread-safe in-memory aggregator for usage deltas.
#[derive(Debug, Default)]
pub struct UsageTracker {
    data: Mutex<HashMap<DateTime<Utc>, UsageRecord>>,
    /// Serializes sync passes.
    sync: tokio::sync::Mutex<()>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add usage for an access key at time `at`.
    pub fn add_key_usage(&self, access_key: &str, at: DateTime<Utc>, delta: UsageDelta) {
        if delta.is_zero() {
            return;
        }
        let mut data = self.data.lock().expect("usage tracker poisoned");
        *data
            .entry(minute_bucket(at))
            .or_default()
            .by_access_key
            .entry(access_key.to_string())
            .or_default() += delta;
    }

    /// Add usage for a project-scoped caller at time `at`.
    pub fn add_project_usage(&self, project_id: u64, at: DateTime<Utc>, delta: UsageDelta) {
        if delta.is_zero() {
            return;
        }
        let mut data = self.data.lock().expect("usage tracker poisoned");
        *data
            .entry(minute_bucket(at))
            .or_default()
            .by_project
            .entry(project_id)
            .or_default() += delta;
    }

    /// Fold a whole bucket back in, summing with anything recorded since.
    fn merge(&self, bucket: DateTime<Utc>, record: UsageRecord) {
        let mut data = self.data.lock().expect("usage tracker poisoned");
        let target = data.entry(bucket).or_default();
        for (key, delta) in record.by_access_key {
            *target.by_access_key.entry(key).or_default() += delta;
        }
        for (project_id, delta) in record.by_project {
            *target.by_project.entry(project_id).or_default() += delta;
        }
    }

    /// Swap the accumulated buckets out for an empty map.
    pub fn take_updates(&self) -> HashMap<DateTime<Utc>, UsageRecord> {
        std::mem::take(&mut *self.data.lock().expect("usage tracker poisoned"))
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().expect("usage tracker poisoned").is_empty()
    }

    /// Push every bucket to `authority`.
    ///
    /// A rejected batch is merged back whole; a partially accepted batch has
    /// only its unacknowledged entries merged back. Returns the last batch
    /// error after every bucket has been attempted. Dropping the future
    /// part-way merges back everything not yet acknowledged.
    pub async fn sync_usage(
        &self,
        authority: &dyn QuotaControl,
        service: Service,
    ) -> Result<SyncReport> {
        let _guard = self.sync.lock().await;

        let mut pending = Pending {
            tracker: self,
            updates: self.take_updates(),
        };
        let buckets: Vec<_> = pending.updates.keys().copied().collect();
        let mut report = SyncReport::default();
        let mut last_err = None;

        for bucket in buckets {
            let keys = pending.by_access_key(bucket);
            if !keys.is_empty() {
                match authority.update_key_usage(service, bucket, keys).await {
                    Ok(accepted) => {
                        if let Some(record) = pending.updates.get_mut(&bucket) {
                            record.by_access_key.retain(|key, _| {
                                let ok = accepted.get(key).copied().unwrap_or(false);
                                if ok {
                                    report.accepted += 1;
                                } else {
                                    report.retried += 1;
                                }
                                !ok
                            });
                        }
                    }
                    Err(e) => {
                        log::error!("Failed to sync access key usage for {}: {}", bucket, e);
                        report.retried += pending.updates[&bucket].by_access_key.len();
                        last_err = Some(e);
                    }
                }
            }

            let projects = pending.by_project(bucket);
            if !projects.is_empty() {
                match authority.update_project_usage(service, bucket, projects).await {
                    Ok(accepted) => {
                        if let Some(record) = pending.updates.get_mut(&bucket) {
                            record.by_project.retain(|project_id, _| {
                                let ok = accepted.get(project_id).copied().unwrap_or(false);
                                if ok {
                                    report.accepted += 1;
                                } else {
                                    report.retried += 1;
                                }
                                !ok
                            });
                        }
                    }
                    Err(e) => {
                        log::error!("Failed to sync project usage for {}: {}", bucket, e);
                        report.retried += pending.updates[&bucket].by_project.len();
                        last_err = Some(e);
                    }
                }
            }
        }
        drop(pending);

        if report.accepted + report.retried > 0 {
            log::debug!(
                "Usage sync: {} accepted, {} retried",
                report.accepted,
                report.retried
            );
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

/// Buckets taken out for one sync pass.
///
/// Entries are removed as the authority acknowledges them; whatever is left
/// when this drops goes back into the tracker.
struct Pending<'a> {
    tracker: &'a UsageTracker,
    updates: HashMap<DateTime<Utc>, UsageRecord>,
}

impl Pending<'_> {
    fn by_access_key(&self, bucket: DateTime<Utc>) -> HashMap<String, UsageDelta> {
        self.updates
            .get(&bucket)
            .map(|record| record.by_access_key.clone())
            .unwrap_or_default()
    }

    fn by_project(&self, bucket: DateTime<Utc>) -> HashMap<u64, UsageDelta> {
        self.updates
            .get(&bucket)
            .map(|record| record.by_project.clone())
            .unwrap_or_default()
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        for (bucket, record) in self.updates.drain() {
            if !record.is_empty() {
                self.tracker.merge(bucket, record);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
