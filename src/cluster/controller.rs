//! Cluster Control - reconciles one collector per sink
//!
//! The control is responsible for:
//! - Classifying a sink's live workload (absent, pending, active, broken)
//! - Applying the three collector objects in dependency order
//! - Waiting, within a bounded number of polls, for the workload to come up
//! - Tearing workloads down, including orphans found by the monitor

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::objects::{collector_objects, sink_slug, workload_name, CollectorSpec};
use super::{ClusterApi, ClusterError, ObjectKind, WorkloadInfo};

/// Observed state of a sink's collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectorState {
    /// No matching workload
    Absent,
    /// Workload exists but reports no conditions yet
    Pending,
    /// Workload reports conditions and no replica failure
    Active,
    /// Workload reports a replica failure
    Broken(String),
}

/// Cluster control configuration
#[derive(Debug, Clone)]
pub struct ClusterControlConfig {
    /// Scans before a sink's workload is declared absent; also bounds
    /// retries of a failing listing
    pub lookup_attempts: u32,

    /// Delay between scans
    pub lookup_interval: Duration,

    /// Polls after applying before giving up on the workload becoming active
    pub poll_attempts: u32,

    /// Delay between polls
    pub poll_interval: Duration,
}

impl Default for ClusterControlConfig {
    fn default() -> Self {
        Self {
            lookup_attempts: 5,
            lookup_interval: Duration::from_secs(1),
            poll_attempts: 5,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Whether `workload` is the collector for `sink_id`
pub fn workload_matches(workload: &WorkloadInfo, sink_id: &str) -> bool {
    workload.name == workload_name(sink_id)
        || workload
            .labels
            .get("sink-id")
            .is_some_and(|label| *label == sink_slug(sink_id))
}

fn classify(workload: &WorkloadInfo) -> CollectorState {
    if let Some(failure) = workload.replica_failure() {
        let reason = failure
            .message
            .clone()
            .or_else(|| failure.reason.clone())
            .unwrap_or_else(|| "replica failure".to_string());
        return CollectorState::Broken(reason);
    }
    if workload.conditions.is_empty() {
        CollectorState::Pending
    } else {
        CollectorState::Active
    }
}

/// Applies, polls and deletes collector workloads
#[derive(Clone)]
pub struct ClusterControl {
    api: Arc<dyn ClusterApi>,
    spec: CollectorSpec,
    config: ClusterControlConfig,
}

impl ClusterControl {
    pub fn new(api: Arc<dyn ClusterApi>, spec: CollectorSpec) -> Self {
        Self::with_config(api, spec, ClusterControlConfig::default())
    }

    pub fn with_config(api: Arc<dyn ClusterApi>, spec: CollectorSpec, config: ClusterControlConfig) -> Self {
        Self { api, spec, config }
    }

    pub fn spec(&self) -> &CollectorSpec {
        &self.spec
    }

    async fn list_with_retry(&self) -> Result<Vec<WorkloadInfo>, ClusterError> {
        let attempts = self.config.lookup_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.api.list_workloads().await {
                Ok(workloads) => return Ok(workloads),
                Err(e) if attempt < attempts => {
                    debug!("Listing workloads failed (attempt {}/{}): {}", attempt, attempts, e);
                    attempt += 1;
                    tokio::time::sleep(self.config.lookup_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Current state of the collector for `sink_id`
    ///
    /// Absent only once `lookup_attempts` scans in a row found no matching
    /// workload. A listing error is retried within the same budget.
    pub async fn lookup(&self, sink_id: &str) -> Result<CollectorState, ClusterError> {
        let attempts = self.config.lookup_attempts.max(1);

        for attempt in 1..=attempts {
            match self.api.list_workloads().await {
                Ok(workloads) => {
                    if let Some(workload) = workloads.iter().find(|w| workload_matches(w, sink_id)) {
                        return Ok(classify(workload));
                    }
                    debug!("No workload for {} (scan {}/{})", sink_id, attempt, attempts);
                }
                Err(e) if attempt < attempts => {
                    debug!("Listing workloads failed (scan {}/{}): {}", attempt, attempts, e);
                }
                Err(e) => return Err(e),
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.lookup_interval).await;
            }
        }
        Ok(CollectorState::Absent)
    }

    /// Create the collector unless it is already active
    ///
    /// Returns the workload name once it reports active.
    pub async fn create(&self, owner_id: &str, sink_id: &str, manifest: &str) -> Result<String, ClusterError> {
        let name = workload_name(sink_id);

        match self.lookup(sink_id).await? {
            CollectorState::Active => {
                debug!("Collector {} for {}/{} already active", name, owner_id, sink_id);
                return Ok(name);
            }
            CollectorState::Broken(reason) => {
                return Err(ClusterError::Broken(name, reason));
            }
            CollectorState::Absent | CollectorState::Pending => {}
        }

        self.apply_all(owner_id, sink_id, manifest, false).await?;
        info!("Applied collector {} for {}/{}", name, owner_id, sink_id);

        self.wait_active(sink_id).await?;
        Ok(name)
    }

    /// Re-apply all objects, replacing on conflict
    pub async fn update(&self, owner_id: &str, sink_id: &str, manifest: &str) -> Result<String, ClusterError> {
        let name = workload_name(sink_id);
        self.apply_all(owner_id, sink_id, manifest, true).await?;
        info!("Re-applied collector {} for {}/{}", name, owner_id, sink_id);

        self.wait_active(sink_id).await?;
        Ok(name)
    }

    /// Delete the collector workload; returns false if there was none
    pub async fn delete(&self, owner_id: &str, sink_id: &str) -> Result<bool, ClusterError> {
        if self.lookup(sink_id).await? == CollectorState::Absent {
            debug!("No collector to delete for {}/{}", owner_id, sink_id);
            return Ok(false);
        }

        let name = workload_name(sink_id);
        self.api.delete(ObjectKind::Deployment, &name).await?;
        info!("Deleted collector {} for {}/{}", name, owner_id, sink_id);
        Ok(true)
    }

    /// Delete a workload by name, used for orphans with no sink record
    pub async fn delete_workload(&self, name: &str) -> Result<(), ClusterError> {
        self.api.delete(ObjectKind::Deployment, name).await?;
        if let Err(e) = self.api.delete(ObjectKind::Service, name).await {
            warn!("Failed to delete service {}: {}", name, e);
        }
        info!("Deleted workload {}", name);
        Ok(())
    }

    /// All running collector workloads
    pub async fn list_collectors(&self) -> Result<Vec<WorkloadInfo>, ClusterError> {
        self.list_with_retry().await
    }

    pub async fn collector_logs(&self, name: &str, tail: u32, since: Duration) -> Result<Vec<String>, ClusterError> {
        self.api.logs(name, tail, since).await
    }

    async fn apply_all(&self, owner_id: &str, sink_id: &str, manifest: &str, force: bool) -> Result<(), ClusterError> {
        for object in collector_objects(&self.spec, owner_id, sink_id, manifest) {
            self.api.apply(&object, force).await?;
        }
        Ok(())
    }

    /// Poll until active; broken is terminal, absent/pending and list errors are retried
    async fn wait_active(&self, sink_id: &str) -> Result<(), ClusterError> {
        let name = workload_name(sink_id);
        let attempts = self.config.poll_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.api.list_workloads().await {
                Ok(workloads) => {
                    let state = workloads
                        .iter()
                        .find(|w| workload_matches(w, sink_id))
                        .map(classify)
                        .unwrap_or(CollectorState::Absent);

                    match state {
                        CollectorState::Active => return Ok(()),
                        CollectorState::Broken(reason) => {
                            return Err(ClusterError::Broken(name, reason));
                        }
                        other => {
                            debug!("Collector {} is {:?} (poll {}/{})", name, other, attempt, attempts);
                            last_error = None;
                        }
                    }
                }
                Err(e) => {
                    debug!("Polling collector {} failed (poll {}/{}): {}", name, attempt, attempts, e);
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }

        warn!("Collector {} did not become active after {} polls", name, attempts);
        Err(last_error.unwrap_or(ClusterError::NotActive(name)))
    }
}
