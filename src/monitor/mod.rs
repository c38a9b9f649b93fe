//! Collector monitor
//!
//! Periodically walks the running collectors, removes the ones no sink owns,
//! and turns each collector's recent logs into a tenant-visible status.

pub mod classify;

pub use classify::{classify_line, classify_logs, Classification};

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cluster::{workload_matches, ClusterError, WorkloadInfo};
use crate::deployment::DeploymentService;
use crate::metrics::ServiceMetrics;
use crate::registry::{RegistryError, SinkRegistry, SinkSummary};

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Monitor loop settings
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Log lines inspected per collector
    pub log_tail: u32,
    /// How far back log lines are read
    pub log_since: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            log_tail: 50,
            log_since: Duration::from_secs(300),
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub inspected: u64,
    pub orphans_removed: u64,
    pub status_updates: u64,
    /// Collectors whose logs could not be classified
    pub skipped: u64,
    pub failures: u64,
}

/// What happened to one workload
enum Outcome {
    OrphanRemoved,
    Unchanged,
    Updated,
    Skipped,
}

pub struct Monitor {
    service: DeploymentService,
    registry: Arc<dyn SinkRegistry>,
    config: MonitorConfig,
    metrics: Arc<ServiceMetrics>,
}

impl Monitor {
    pub fn new(
        service: DeploymentService,
        registry: Arc<dyn SinkRegistry>,
        config: MonitorConfig,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            service,
            registry,
            config,
            metrics,
        }
    }

    /// One pass over the running collectors, inspecting them concurrently
    pub async fn tick(&self) -> Result<TickReport, MonitorError> {
        let mut report = TickReport::default();

        let workloads = self.service.cluster().list_collectors().await?;
        if workloads.is_empty() {
            debug!("No running collectors, skipping tick");
            return Ok(report);
        }

        let roster = self.registry.list_export_enabled().await?;
        debug!(
            "Inspecting {} collectors against {} export-enabled sinks",
            workloads.len(),
            roster.len()
        );

        let outcomes = join_all(workloads.iter().map(|workload| {
            let sink = roster.iter().find(|s| workload_matches(workload, &s.id));
            async move { (workload, self.inspect(workload, sink).await) }
        }))
        .await;

        for (workload, outcome) in outcomes {
            report.inspected += 1;
            match outcome {
                Ok(Outcome::OrphanRemoved) => report.orphans_removed += 1,
                Ok(Outcome::Updated) => report.status_updates += 1,
                Ok(Outcome::Skipped) => report.skipped += 1,
                Ok(Outcome::Unchanged) => {}
                Err(e) => {
                    warn!("Monitoring {} failed: {}", workload.name, e);
                    report.failures += 1;
                }
            }
        }

        Ok(report)
    }

    async fn inspect(&self, workload: &WorkloadInfo, sink: Option<&SinkSummary>) -> Result<Outcome, String> {
        let cluster = self.service.cluster();

        let Some(sink) = sink else {
            info!("Collector {} has no export-enabled sink, removing it", workload.name);
            cluster
                .delete_workload(&workload.name)
                .await
                .map_err(|e| e.to_string())?;
            return Ok(Outcome::OrphanRemoved);
        };

        let lines = cluster
            .collector_logs(&workload.name, self.config.log_tail, self.config.log_since)
            .await
            .map_err(|e| e.to_string())?;

        let classification = classify_logs(&lines);
        let Some((status, message)) = classification.status() else {
            if let Classification::Fail(reason) = &classification {
                warn!(
                    "Could not classify logs of {} for {}/{}: {}",
                    workload.name, sink.owner_id, sink.id, reason
                );
            }
            return Ok(Outcome::Skipped);
        };

        if status.as_str() == sink.state {
            return Ok(Outcome::Unchanged);
        }

        info!(
            "Sink {}/{} is now {} (was '{}')",
            sink.owner_id, sink.id, status, sink.state
        );
        self.service
            .update_status(&sink.owner_id, &sink.id, status, message)
            .await
            .map_err(|e| e.to_string())?;
        Ok(Outcome::Updated)
    }

    /// Tick every `interval` until `shutdown` fires
    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Monitor started, checking collectors every {:?}", self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) => {
                            self.metrics.record_tick(
                                report.inspected,
                                report.orphans_removed,
                                report.status_updates,
                                report.skipped,
                                report.failures,
                            );
                            if report.inspected > 0 {
                                info!(
                                    "Monitor tick: {} inspected, {} orphans removed, {} updated, {} skipped, {} failed",
                                    report.inspected,
                                    report.orphans_removed,
                                    report.status_updates,
                                    report.skipped,
                                    report.failures
                                );
                            }
                        }
                        Err(e) => {
                            self.metrics.record_tick(0, 0, 0, 0, 1);
                            error!("Monitor tick failed: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Monitor shutting down");
                    break;
                }
            }
        }
    }
}
