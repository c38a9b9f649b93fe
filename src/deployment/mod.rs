//! Deployment records and their lifecycle
//!
//! A [`Deployment`] is the orchestrator's source of truth for one sink's
//! collector. Exactly one exists per `(owner_id, sink_id)`.
//!
//! ```text
//! pending ──▶ provisioning ──▶ active / warning / error / idle
//!                 ▲                          │
//!                 └──── update / activity ───┘
//!
//! any state ──▶ provisioning_error ──▶ provisioning (next successful retry)
//! ```

pub mod postgres;
pub mod repository;
pub mod service;

pub use postgres::PostgresRepository;
pub use repository::{DeploymentRepository, MemoryRepository, RepositoryError};
pub use service::{DeploymentError, DeploymentService, ErrorKind};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{merge_config, ConfigMap};

/// Tenant-visible deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Provisioning,
    Active,
    Idle,
    Warning,
    Error,
    ProvisioningError,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::ProvisioningError => "provisioning_error",
        }
    }

    /// Whether this status carries an error message worth keeping
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Warning | Self::Error | Self::ProvisioningError)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "provisioning" => Ok(Self::Provisioning),
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "provisioning_error" => Ok(Self::ProvisioningError),
            other => Err(format!("unknown deployment status '{}'", other)),
        }
    }
}

/// Collector action requested through `notify_collector`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorOperation {
    Deploy,
    Delete,
}

impl fmt::Display for CollectorOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deploy => f.write_str("deploy"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// One tenant sink's collector deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub owner_id: String,
    pub sink_id: String,
    /// Exporter family, e.g. "prometheus" or "otlphttp"
    pub backend: String,
    /// Sink config; secret fields are encrypted while persisted
    pub config: ConfigMap,
    pub last_status: DeploymentStatus,
    pub last_status_update: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
    /// Set only while the collector is believed to be running
    pub collector_name: Option<String>,
    pub last_collector_deploy_time: Option<DateTime<Utc>>,
    pub last_collector_stop_time: Option<DateTime<Utc>>,
}

impl Deployment {
    /// New record in the `pending` state
    pub fn new(
        owner_id: impl Into<String>,
        sink_id: impl Into<String>,
        backend: impl Into<String>,
        config: ConfigMap,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            sink_id: sink_id.into(),
            backend: backend.into(),
            config,
            last_status: DeploymentStatus::Pending,
            last_status_update: Some(Utc::now()),
            last_error_message: None,
            last_error_time: None,
            collector_name: None,
            last_collector_deploy_time: None,
            last_collector_stop_time: None,
        }
    }

    /// The latest deploy postdates the latest stop
    pub fn is_collector_running(&self) -> bool {
        match (self.last_collector_deploy_time, self.last_collector_stop_time) {
            (Some(deployed), Some(stopped)) => deployed > stopped,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Merge the non-empty parts of `other` over this record
    pub fn merge_from(&mut self, other: &Deployment) {
        if !other.backend.is_empty() {
            self.backend = other.backend.clone();
        }
        merge_config(&mut self.config, &other.config);
    }

    /// Stamp a status, keeping or clearing the error fields as appropriate
    pub fn set_status(&mut self, status: DeploymentStatus, error_message: Option<&str>, at: DateTime<Utc>) {
        self.last_status = status;
        self.last_status_update = Some(at);

        match error_message.filter(|m| !m.is_empty()) {
            Some(message) => {
                self.last_error_message = Some(message.to_string());
                self.last_error_time = Some(at);
            }
            None if !status.is_failure() => {
                self.last_error_message = None;
            }
            None => {}
        }
    }

    pub fn mark_collector_deployed(&mut self, collector_name: &str, at: DateTime<Utc>) {
        self.collector_name = Some(collector_name.to_string());
        self.last_collector_deploy_time = Some(at);
    }

    pub fn mark_collector_stopped(&mut self, at: DateTime<Utc>) {
        self.collector_name = None;
        self.last_collector_stop_time = Some(at);
    }
}
