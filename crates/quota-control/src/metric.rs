//! In-process counters fed by the proxy after every pipeline run.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::middleware::{Outcome, QUOTA_COST};
use crate::model::Service;

/// Pipeline verdicts for one service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceMetrics {
    /// Requests let through with every stage answering.
    pub allowed: u64,
    /// Requests let through while at least one stage could not reach its
    /// store, keyed by stage.
    pub failed_open: BTreeMap<&'static str, u64>,
    /// Rejections keyed by error name.
    pub rejected: BTreeMap<&'static str, u64>,
    /// Compute units charged to quotas by allowed requests.
    pub compute_units: i64,
}

#[derive(Default)]
pub struct Metrics {
    services: Mutex<HashMap<Service, ServiceMetrics>>,
    /// Response status counts per project.
    projects: Mutex<HashMap<u64, BTreeMap<u16, u64>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count the pipeline's verdict for one request.
    pub fn observe(&self, service: Service, outcome: &Outcome) {
        let mut services = self.services.lock().expect("metrics store poisoned");
        let stats = services.entry(service).or_default();
        for stage in &outcome.degraded {
            *stats.failed_open.entry(stage).or_insert(0) += 1;
        }
        match &outcome.rejection {
            Some(err) => *stats.rejected.entry(err.name()).or_insert(0) += 1,
            None => {
                if outcome.degraded.is_empty() {
                    stats.allowed += 1;
                }
                if outcome.header(QUOTA_COST).is_some() {
                    stats.compute_units += outcome.cost;
                }
            }
        }
    }

    /// Count the status a project's caller was answered with.
    pub fn record_status(&self, project_id: u64, status: u16) {
        let mut projects = self.projects.lock().expect("metrics store poisoned");
        *projects
            .entry(project_id)
            .or_default()
            .entry(status)
            .or_insert(0) += 1;
    }

    pub fn service(&self, service: Service) -> ServiceMetrics {
        self.services
            .lock()
            .expect("metrics store poisoned")
            .get(&service)
            .cloned()
            .unwrap_or_default()
    }

    pub fn status_count(&self, project_id: u64, status: u16) -> u64 {
        self.projects
            .lock()
            .expect("metrics store poisoned")
            .get(&project_id)
            .and_then(|statuses| statuses.get(&status))
            .copied()
            .unwrap_or(0)
    }
}
