//! # Collector cluster control
//!
//! One collector instance is three namespaced cluster objects, all named
//! deterministically from the sink id:
//!
//! ```text
//!   ConfigMap   otel-collector-config-<sink>   rendered collector YAML
//!       │ mounted by
//!       ▼
//!   Deployment  otel-<sink>                    1 replica, ports 8888 / 13133
//!       │ selected by
//!       ▼
//!   Service     otel-<sink>                    stable metrics/health address
//! ```
//!
//! [`ClusterApi`] is the seam to the real cluster; [`KubectlApi`] drives
//! `kubectl`, [`MemoryCluster`] stands in for tests. [`ClusterControl`] holds
//! the create/update/delete reconciliation logic on top of either.

pub mod controller;
pub mod kubectl;
pub mod memory;
pub mod objects;

pub use controller::{workload_matches, ClusterControl, ClusterControlConfig, CollectorState};
pub use kubectl::{KubectlApi, KubectlConfig};
pub use memory::MemoryCluster;
pub use objects::{collector_objects, CollectorSpec};

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Collector self-metrics port
pub const METRICS_PORT: u16 = 8888;

/// Collector health_check extension port
pub const HEALTH_PORT: u16 = 13133;

/// Condition type a workload reports when it cannot create replicas
pub const REPLICA_FAILURE: &str = "ReplicaFailure";

/// Errors from cluster operations
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Cluster command failed: {0}")]
    Command(String),

    #[error("Failed to apply {0}: {1}")]
    Apply(String, String),

    #[error("Failed to parse cluster response: {0}")]
    Parse(String),

    #[error("Collector '{0}' is broken: {1}")]
    Broken(String, String),

    #[error("Collector '{0}' did not become active")]
    NotActive(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The three object kinds that make up a collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    ConfigMap,
    Deployment,
    Service,
}

impl ObjectKind {
    /// Resource name as understood by kubectl
    pub fn resource(&self) -> &'static str {
        match self {
            Self::ConfigMap => "configmap",
            Self::Deployment => "deployment",
            Self::Service => "service",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.resource())
    }
}

/// A fully rendered cluster object ready to apply
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterObject {
    pub kind: ObjectKind,
    pub name: String,
    pub body: Value,
}

/// One status condition reported by a workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl WorkloadCondition {
    pub fn new(condition_type: &str, status: &str) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: status.to_string(),
            reason: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }
}

/// Observed state of a collector workload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub conditions: Vec<WorkloadCondition>,
}

impl WorkloadInfo {
    /// The replica-failure condition, if it is currently true
    pub fn replica_failure(&self) -> Option<&WorkloadCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == REPLICA_FAILURE && c.status == "True")
    }
}

/// Seam to the container orchestration cluster
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create or update an object; `force` replaces on conflict
    async fn apply(&self, object: &ClusterObject, force: bool) -> Result<(), ClusterError>;

    /// Delete an object; deleting an absent object succeeds
    async fn delete(&self, kind: ObjectKind, name: &str) -> Result<(), ClusterError>;

    /// All collector workloads in the namespace
    async fn list_workloads(&self) -> Result<Vec<WorkloadInfo>, ClusterError>;

    /// Recent log lines of a workload
    async fn logs(&self, name: &str, tail: u32, since: Duration) -> Result<Vec<String>, ClusterError>;
}
