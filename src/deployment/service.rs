//! Deployment Service
//!
//! Orchestrates the config builder, the credential cipher, the repository,
//! cluster control and the status producer. Secret fields are encrypted
//! before anything is persisted and decrypted only inside this module, so
//! every value leaving the service is plaintext and every value stored is not.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::repository::{DeploymentRepository, RepositoryError};
use super::{CollectorOperation, Deployment, DeploymentStatus};
use crate::cluster::{ClusterControl, ClusterError};
use crate::config::{
    decrypt_secrets, encrypt_secrets, AuthStrategy, CipherError, ConfigBuilder, ConfigError, ConfigMap,
    CredentialCipher,
};
use crate::events::{EventError, StatusChangeEvent, StatusProducer, StreamError, STATUS_UNKNOWN};
use crate::metrics::ServiceMetrics;

/// Error classes as seen by callers deciding whether to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed event or config; never retried automatically
    Validation,
    NotFound,
    AlreadyExists,
    /// Stored credentials failed to decrypt
    Cipher,
    Cluster,
    Storage,
    Stream,
}

/// Errors from deployment operations
#[derive(Error, Debug)]
pub enum DeploymentError {
    #[error("Invalid sink configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Credential error: {0}")]
    Cipher(#[from] CipherError),

    #[error("{0}")]
    Repository(#[from] RepositoryError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Invalid event: {0}")]
    Event(#[from] EventError),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl DeploymentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::Event(_) | Self::Validation(_) => ErrorKind::Validation,
            Self::Cipher(_) => ErrorKind::Cipher,
            Self::Repository(RepositoryError::NotFound(_, _)) => ErrorKind::NotFound,
            Self::Repository(RepositoryError::AlreadyExists(_, _)) => ErrorKind::AlreadyExists,
            Self::Repository(_) => ErrorKind::Storage,
            Self::Cluster(_) => ErrorKind::Cluster,
            Self::Stream(_) => ErrorKind::Stream,
        }
    }

    /// Short text suitable for `last_error_message`
    pub fn tenant_message(&self) -> String {
        match self {
            Self::Config(e) => e.to_string(),
            Self::Event(e) => e.to_string(),
            Self::Validation(msg) => msg.clone(),
            Self::Cipher(_) => "stored credentials could not be decrypted, please re-enter them".to_string(),
            Self::Repository(RepositoryError::NotFound(_, _)) => "deployment not found".to_string(),
            Self::Cluster(ClusterError::Broken(_, reason)) => {
                format!("collector failed to start: {}", reason)
            }
            Self::Cluster(_) => "failed to deploy collector".to_string(),
            Self::Repository(_) | Self::Stream(_) => "internal error, will retry".to_string(),
        }
    }
}

/// Whether `config` carries an authentication block that stands on its own
fn replaces_credentials(config: &ConfigMap) -> bool {
    config
        .get("authentication")
        .and_then(Value::as_object)
        .is_some_and(|auth| AuthStrategy::from_config(auth).is_ok())
}

/// Orchestrates persistence, manifests, cluster state and status events
#[derive(Clone)]
pub struct DeploymentService {
    repo: Arc<dyn DeploymentRepository>,
    cluster: ClusterControl,
    producer: StatusProducer,
    builder: ConfigBuilder,
    cipher: CredentialCipher,
    metrics: Arc<ServiceMetrics>,
}

impl DeploymentService {
    pub fn new(
        repo: Arc<dyn DeploymentRepository>,
        cluster: ClusterControl,
        producer: StatusProducer,
        builder: ConfigBuilder,
        cipher: CredentialCipher,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            repo,
            cluster,
            producer,
            builder,
            cipher,
            metrics,
        }
    }

    pub fn cluster(&self) -> &ClusterControl {
        &self.cluster
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.metrics
    }

    /// Wrap an operation in logging and metrics
    async fn observe<T, F>(&self, operation: &'static str, owner_id: &str, sink_id: &str, fut: F) -> Result<T, DeploymentError>
    where
        F: Future<Output = Result<T, DeploymentError>>,
    {
        self.metrics.record_start(operation);
        let started = Instant::now();
        let result = fut.await;
        let elapsed = started.elapsed();
        self.metrics.record_end(operation, elapsed, result.is_ok());

        match &result {
            Ok(_) => debug!("{} {}/{} ok in {:?}", operation, owner_id, sink_id, elapsed),
            Err(e) => warn!("{} {}/{} failed after {:?}: {}", operation, owner_id, sink_id, elapsed, e),
        }
        result
    }

    fn encrypted(&self, config: &ConfigMap) -> Result<ConfigMap, DeploymentError> {
        let mut sealed = config.clone();
        encrypt_secrets(&mut sealed, &self.cipher)?;
        Ok(sealed)
    }

    fn decrypted(&self, mut deployment: Deployment) -> Result<Deployment, DeploymentError> {
        decrypt_secrets(&mut deployment.config, &self.cipher)?;
        Ok(deployment)
    }

    async fn emit(&self, owner_id: &str, sink_id: &str, status: &str, error_message: Option<&str>) -> Result<(), DeploymentError> {
        let event = StatusChangeEvent::new(owner_id, sink_id, status, error_message);
        self.producer.publish(&event).await?;
        Ok(())
    }

    // =========================================================================
    // Create / read
    // =========================================================================

    /// Persist a new deployment
    ///
    /// A config that does not render is still stored, as `provisioning_error`,
    /// so the tenant can see what is wrong and fix it with an update.
    pub async fn create_deployment(
        &self,
        owner_id: &str,
        sink_id: &str,
        backend: &str,
        config: ConfigMap,
    ) -> Result<Deployment, DeploymentError> {
        self.observe("create_deployment", owner_id, sink_id, async {
            let render_error = self.builder.render(sink_id, backend, &config).err();

            let mut deployment = Deployment::new(owner_id, sink_id, backend, self.encrypted(&config)?);
            let emitted_status = match render_error {
                Some(ref e) => {
                    let message = DeploymentError::Config(e.clone()).tenant_message();
                    deployment.set_status(DeploymentStatus::ProvisioningError, Some(&message), Utc::now());
                    DeploymentStatus::ProvisioningError.as_str()
                }
                None => STATUS_UNKNOWN,
            };

            self.repo.insert(&deployment).await?;
            info!("Created deployment for {}/{} ({})", owner_id, sink_id, backend);

            self.emit(owner_id, sink_id, emitted_status, deployment.last_error_message.as_deref())
                .await?;

            deployment.config = config;
            Ok(deployment)
        })
        .await
    }

    /// Load and decrypt a deployment, if it exists
    pub async fn find_deployment(&self, owner_id: &str, sink_id: &str) -> Result<Option<Deployment>, DeploymentError> {
        self.repo
            .get(owner_id, sink_id)
            .await?
            .map(|d| self.decrypted(d))
            .transpose()
    }

    async fn require(&self, owner_id: &str, sink_id: &str) -> Result<Deployment, DeploymentError> {
        self.find_deployment(owner_id, sink_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(owner_id.to_string(), sink_id.to_string()).into())
    }

    /// Whether a deployment row exists, without decrypting it
    pub async fn deployment_exists(&self, owner_id: &str, sink_id: &str) -> Result<bool, DeploymentError> {
        Ok(self.repo.get(owner_id, sink_id).await?.is_some())
    }

    /// Decrypted deployment plus its rendered collector manifest
    pub async fn get_deployment(&self, owner_id: &str, sink_id: &str) -> Result<(Deployment, String), DeploymentError> {
        self.observe("get_deployment", owner_id, sink_id, async {
            let deployment = self.require(owner_id, sink_id).await?;
            let manifest = self
                .builder
                .render(&deployment.sink_id, &deployment.backend, &deployment.config)?;
            Ok((deployment, manifest))
        })
        .await
    }

    // =========================================================================
    // Update
    // =========================================================================

    /// Merge `update` over the stored deployment and mark it provisioning
    ///
    /// A running collector is stopped first; failing to stop it is logged and
    /// does not block the update. The merged config is sealed as a whole, so
    /// secrets are encrypted according to the merged authentication type.
    ///
    /// Stored credentials that no longer decrypt are replaced when the update
    /// carries a complete authentication block. Otherwise the deployment is
    /// marked `provisioning_error` and the cipher error is returned.
    pub async fn update_deployment(&self, update: Deployment) -> Result<Deployment, DeploymentError> {
        let owner_id = update.owner_id.clone();
        let sink_id = update.sink_id.clone();

        self.observe("update_deployment", &owner_id, &sink_id, async {
            let stored = self
                .repo
                .get(&owner_id, &sink_id)
                .await?
                .ok_or_else(|| RepositoryError::NotFound(owner_id.clone(), sink_id.clone()))?;

            let mut merged = match self.decrypted(stored.clone()) {
                Ok(existing) => existing,
                Err(e @ DeploymentError::Cipher(_)) if replaces_credentials(&update.config) => {
                    warn!(
                        "Stored credentials for {}/{} unreadable ({}), replacing them from the update",
                        owner_id, sink_id, e
                    );
                    let mut base = stored;
                    base.config.remove("authentication");
                    base
                }
                Err(e) => {
                    let message = e.tenant_message();
                    self.stamp_status(&owner_id, &sink_id, DeploymentStatus::ProvisioningError, Some(&message))
                        .await?;
                    return Err(e);
                }
            };

            let mut stopped_at = None;
            if merged.is_collector_running() {
                match self.cluster.delete(&owner_id, &sink_id).await {
                    Ok(_) => stopped_at = Some(Utc::now()),
                    Err(e) => warn!(
                        "Failed to stop collector for {}/{} before update, continuing: {}",
                        owner_id, sink_id, e
                    ),
                }
            }

            merged.merge_from(&update);
            let (status, message) = match self.builder.render(&sink_id, &merged.backend, &merged.config) {
                Ok(_) => (DeploymentStatus::Provisioning, None),
                Err(e) => (
                    DeploymentStatus::ProvisioningError,
                    Some(DeploymentError::Config(e).tenant_message()),
                ),
            };

            let sealed = self.encrypted(&merged.config)?;
            let backend = merged.backend;

            let now = Utc::now();
            let stored = self
                .repo
                .modify(
                    &owner_id,
                    &sink_id,
                    Box::new(|row| {
                        row.backend = backend;
                        row.config = sealed;
                        if let Some(at) = stopped_at {
                            row.mark_collector_stopped(at);
                        }
                        row.set_status(status, message.as_deref(), now);
                        true
                    }),
                )
                .await?;
            info!("Updated deployment for {}/{}", owner_id, sink_id);

            self.emit(&owner_id, &sink_id, status.as_str(), message.as_deref()).await?;
            self.decrypted(stored)
        })
        .await
    }

    // =========================================================================
    // Collector lifecycle
    // =========================================================================

    /// Deploy or delete the collector, then apply any supplied status
    pub async fn notify_collector(
        &self,
        owner_id: &str,
        sink_id: &str,
        operation: CollectorOperation,
        status: Option<DeploymentStatus>,
        error_message: Option<&str>,
    ) -> Result<Deployment, DeploymentError> {
        self.observe("notify_collector", owner_id, sink_id, async {
            let mut deployed = None;
            let mut stopped = false;

            match operation {
                CollectorOperation::Delete => {
                    self.cluster.delete(owner_id, sink_id).await?;
                    stopped = true;
                }
                CollectorOperation::Deploy => {
                    let current = self.require(owner_id, sink_id).await?;
                    if current.is_collector_running() {
                        debug!("Collector for {}/{} already running, skipping deploy", owner_id, sink_id);
                    } else {
                        let (_, manifest) = self.get_deployment(owner_id, sink_id).await?;
                        deployed = Some(self.cluster.create(owner_id, sink_id, &manifest).await?);
                    }
                }
            }

            let now = Utc::now();
            let stored = self
                .repo
                .modify(
                    owner_id,
                    sink_id,
                    Box::new(|row| {
                        if let Some(ref name) = deployed {
                            row.mark_collector_deployed(name, now);
                        }
                        if stopped {
                            row.mark_collector_stopped(now);
                        }
                        if let Some(status) = status {
                            row.set_status(status, error_message, now);
                        }
                        true
                    }),
                )
                .await?;

            if let Some(ref name) = deployed {
                info!("Deployed collector {} for {}/{}", name, owner_id, sink_id);
            }
            if stopped {
                info!("Stopped collector for {}/{}", owner_id, sink_id);
            }
            if let Some(status) = status {
                self.emit(owner_id, sink_id, status.as_str(), error_message).await?;
            }
            self.decrypted(stored)
        })
        .await
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Stamp a status on the deployment and announce it
    ///
    /// Works on rows whose credentials no longer decrypt.
    pub async fn update_status(
        &self,
        owner_id: &str,
        sink_id: &str,
        status: DeploymentStatus,
        error_message: Option<&str>,
    ) -> Result<(), DeploymentError> {
        self.observe("update_status", owner_id, sink_id, async {
            self.stamp_status(owner_id, sink_id, status, error_message).await
        })
        .await
    }

    async fn stamp_status(
        &self,
        owner_id: &str,
        sink_id: &str,
        status: DeploymentStatus,
        error_message: Option<&str>,
    ) -> Result<(), DeploymentError> {
        let now = Utc::now();
        self.repo
            .modify(
                owner_id,
                sink_id,
                Box::new(|row| {
                    row.set_status(status, error_message, now);
                    true
                }),
            )
            .await?;

        self.emit(owner_id, sink_id, status.as_str(), error_message).await
    }

    /// Fire-and-forget status update
    ///
    /// The result is ignored. The hint is stamped with the time it was issued
    /// and dropped if the row has been written since, so it never overwrites
    /// the status an operation settled on.
    pub fn submit_status_hint(&self, owner_id: &str, sink_id: &str, status: DeploymentStatus) -> JoinHandle<()> {
        let service = self.clone();
        let owner_id = owner_id.to_string();
        let sink_id = sink_id.to_string();
        let issued_at = Utc::now();

        tokio::spawn(async move {
            let mut applied = false;
            let result = service
                .repo
                .modify(
                    &owner_id,
                    &sink_id,
                    Box::new(|row| {
                        if row.last_status_update.is_some_and(|t| t > issued_at) {
                            return false;
                        }
                        row.set_status(status, None, issued_at);
                        applied = true;
                        true
                    }),
                )
                .await;

            match result {
                Ok(_) if applied => {
                    if let Err(e) = service.emit(&owner_id, &sink_id, status.as_str(), None).await {
                        warn!("Status hint event for {}/{} not published: {}", owner_id, sink_id, e);
                    }
                }
                Ok(_) => debug!("Stale status hint '{}' for {}/{} dropped", status, owner_id, sink_id),
                Err(e) => warn!("Status hint '{}' for {}/{} failed: {}", status, owner_id, sink_id, e),
            }
        })
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Delete the stored deployment; the collector must already be torn down
    pub async fn remove_deployment(&self, owner_id: &str, sink_id: &str) -> Result<(), DeploymentError> {
        self.observe("remove_deployment", owner_id, sink_id, async {
            self.repo.delete(owner_id, sink_id).await?;
            info!("Removed deployment for {}/{}", owner_id, sink_id);
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterControlConfig, CollectorSpec, MemoryCluster, ObjectKind};
    use crate::deployment::MemoryRepository;
    use crate::events::{Fields, MemoryStream};
    use serde_json::json;
    use std::time::Duration;

    const STATUS_STREAM: &str = "sinks.status";

    struct Harness {
        service: DeploymentService,
        repo: Arc<MemoryRepository>,
        cluster: Arc<MemoryCluster>,
        stream: Arc<MemoryStream>,
    }

    impl Harness {
        async fn statuses(&self) -> Vec<Fields> {
            self.stream.entries(STATUS_STREAM).await
        }
    }

    fn harness() -> Harness {
        let repo = Arc::new(MemoryRepository::new());
        let cluster = Arc::new(MemoryCluster::new());
        let stream = Arc::new(MemoryStream::new());
        let control = ClusterControl::with_config(
            cluster.clone(),
            CollectorSpec::default(),
            ClusterControlConfig {
                lookup_attempts: 1,
                lookup_interval: Duration::ZERO,
                poll_attempts: 2,
                poll_interval: Duration::ZERO,
            },
        );
        let service = DeploymentService::new(
            repo.clone(),
            control,
            StatusProducer::new(stream.clone(), STATUS_STREAM),
            ConfigBuilder::default(),
            CredentialCipher::new("test-key"),
            Arc::new(ServiceMetrics::new()),
        );
        Harness {
            service,
            repo,
            cluster,
            stream,
        }
    }

    fn prom_config() -> ConfigMap {
        json!({
            "exporter": {"remote_host": "https://acme.com/prom/push"},
            "authentication": {"type": "basicauth", "username": "prom-user", "password": "dbpass"}
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_encrypts_at_rest() {
        let h = harness();
        let created = h
            .service
            .create_deployment("o1", "s1", "prometheus", prom_config())
            .await
            .unwrap();

        assert_eq!(created.config["authentication"]["password"], "dbpass");
        assert_eq!(created.last_status, DeploymentStatus::Pending);

        let stored = h.repo.get("o1", "s1").await.unwrap().unwrap();
        assert_ne!(stored.config["authentication"]["password"], "dbpass");
        assert_eq!(stored.config["authentication"]["username"], "prom-user");

        let statuses = h.statuses().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0]["status"], "unknown");
    }

    #[tokio::test]
    async fn test_create_duplicate_is_already_exists() {
        let h = harness();
        h.service
            .create_deployment("o1", "s1", "prometheus", prom_config())
            .await
            .unwrap();
        let err = h
            .service
            .create_deployment("o1", "s1", "prometheus", prom_config())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_create_with_bad_config_records_provisioning_error() {
        let h = harness();
        let created = h
            .service
            .create_deployment("o1", "s1", "datadog", prom_config())
            .await
            .unwrap();

        assert_eq!(created.last_status, DeploymentStatus::ProvisioningError);
        assert!(created
            .last_error_message
            .as_deref()
            .unwrap()
            .contains("datadog"));

        let statuses = h.statuses().await;
        assert_eq!(statuses[0]["status"], "provisioning_error");
    }

    #[tokio::test]
    async fn test_get_deployment_renders_manifest() {
        let h = harness();
        h.service
            .create_deployment("o1", "sink-id-11", "prometheus", prom_config())
            .await
            .unwrap();

        let (deployment, manifest) = h.service.get_deployment("o1", "sink-id-11").await.unwrap();
        assert_eq!(deployment.config["authentication"]["password"], "dbpass");
        assert!(manifest.contains("otlp_metrics-sink-id-11"));
        assert!(manifest.contains("password: dbpass"));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let h = harness();
        let err = h.service.get_deployment("o1", "nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_tampered_secret_fails_closed() {
        let h = harness();
        h.service
            .create_deployment("o1", "s1", "prometheus", prom_config())
            .await
            .unwrap();
        h.repo
            .modify(
                "o1",
                "s1",
                Box::new(|row| {
                    row.config["authentication"]["password"] = json!("00ff");
                    true
                }),
            )
            .await
            .unwrap();

        let err = h.service.get_deployment("o1", "s1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cipher);
        assert!(!err.tenant_message().contains("00ff"));
    }

    #[tokio::test]
    async fn test_partial_update_keeps_authentication() {
        let h = harness();
        h.service
            .create_deployment("o1", "s1", "prometheus", prom_config())
            .await
            .unwrap();

        let mut update = Deployment::new("o1", "s1", "", ConfigMap::new());
        update.config = json!({"exporter": {"remote_host": "https://new.example.com"}})
            .as_object()
            .cloned()
            .unwrap();

        let updated = h.service.update_deployment(update).await.unwrap();
        assert_eq!(updated.last_status, DeploymentStatus::Provisioning);
        assert_eq!(updated.backend, "prometheus");
        assert_eq!(updated.config["exporter"]["remote_host"], "https://new.example.com");
        assert_eq!(
            updated.config["authentication"],
            json!({"type": "basicauth", "username": "prom-user", "password": "dbpass"})
        );
    }

    #[tokio::test]
    async fn test_update_stops_running_collector() {
        let h = harness();
        h.service
            .create_deployment("o1", "s1", "prometheus", prom_config())
            .await
            .unwrap();
        h.service
            .notify_collector("o1", "s1", CollectorOperation::Deploy, Some(DeploymentStatus::Active), None)
            .await
            .unwrap();
        assert!(h.cluster.has_workload("otel-s1"));

        let update = Deployment::new("o1", "s1", "", ConfigMap::new());
        let updated = h.service.update_deployment(update).await.unwrap();

        assert!(!h.cluster.has_workload("otel-s1"));
        assert!(!updated.is_collector_running());
        assert!(updated.collector_name.is_none());
    }

    #[tokio::test]
    async fn test_update_with_new_secret_is_encrypted() {
        let h = harness();
        h.service
            .create_deployment("o1", "s1", "prometheus", prom_config())
            .await
            .unwrap();

        let mut update = Deployment::new("o1", "s1", "", ConfigMap::new());
        update.config = json!({"authentication": {"type": "bearertoken", "token": "tok"}})
            .as_object()
            .cloned()
            .unwrap();
        let updated = h.service.update_deployment(update).await.unwrap();

        assert_eq!(updated.config["authentication"], json!({"type": "bearertoken", "token": "tok"}));
        let stored = h.repo.get("o1", "s1").await.unwrap().unwrap();
        assert_ne!(stored.config["authentication"]["token"], "tok");
        assert!(stored.config["authentication"].get("password").is_none());
    }

    fn config_of(value: Value) -> ConfigMap {
        value.as_object().cloned().unwrap()
    }

    async fn corrupt_password(h: &Harness) {
        h.repo
            .modify(
                "o1",
                "s1",
                Box::new(|row| {
                    row.config["authentication"]["password"] = json!("00ff");
                    true
                }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_password_only_update_is_encrypted() {
        let h = harness();
        h.service
            .create_deployment("o1", "s1", "prometheus", prom_config())
            .await
            .unwrap();

        let mut update = Deployment::new("o1", "s1", "", ConfigMap::new());
        update.config = config_of(json!({"authentication": {"password": "newpass"}}));
        let updated = h.service.update_deployment(update).await.unwrap();
        assert_eq!(updated.config["authentication"]["password"], "newpass");

        let stored = h.repo.get("o1", "s1").await.unwrap().unwrap();
        assert_ne!(stored.config["authentication"]["password"], "newpass");
        assert_eq!(stored.config["authentication"]["type"], "basicauth");

        let (reread, _) = h.service.get_deployment("o1", "s1").await.unwrap();
        assert_eq!(
            reread.config["authentication"],
            json!({"type": "basicauth", "username": "prom-user", "password": "newpass"})
        );
    }

    #[tokio::test]
    async fn test_unreadable_credentials_replaced_by_full_block() {
        let h = harness();
        h.service
            .create_deployment("o1", "s1", "prometheus", prom_config())
            .await
            .unwrap();
        corrupt_password(&h).await;

        let mut update = Deployment::new("o1", "s1", "", ConfigMap::new());
        update.config = config_of(json!({
            "authentication": {"type": "basicauth", "username": "prom-user", "password": "fresh"}
        }));
        let updated = h.service.update_deployment(update).await.unwrap();
        assert_eq!(updated.last_status, DeploymentStatus::Provisioning);
        assert_eq!(updated.config["authentication"]["password"], "fresh");
        assert_eq!(updated.config["exporter"]["remote_host"], "https://acme.com/prom/push");

        let stored = h.repo.get("o1", "s1").await.unwrap().unwrap();
        assert_ne!(stored.config["authentication"]["password"], "fresh");
        let (reread, _) = h.service.get_deployment("o1", "s1").await.unwrap();
        assert_eq!(reread.config["authentication"]["password"], "fresh");
    }

    #[tokio::test]
    async fn test_unreadable_credentials_with_partial_update_marks_error() {
        let h = harness();
        h.service
            .create_deployment("o1", "s1", "prometheus", prom_config())
            .await
            .unwrap();
        corrupt_password(&h).await;

        let mut update = Deployment::new("o1", "s1", "", ConfigMap::new());
        update.config = config_of(json!({"exporter": {"remote_host": "https://b"}}));
        let err = h.service.update_deployment(update).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cipher);

        let stored = h.repo.get("o1", "s1").await.unwrap().unwrap();
        assert_eq!(stored.last_status, DeploymentStatus::ProvisioningError);
        assert_eq!(stored.last_error_message, Some(err.tenant_message()));
        assert_eq!(stored.config["exporter"]["remote_host"], "https://acme.com/prom/push");

        let statuses = h.statuses().await;
        assert_eq!(statuses.last().unwrap()["status"], "provisioning_error");
    }

    #[tokio::test]
    async fn test_deploy_then_delete() {
        let h = harness();
        h.service
            .create_deployment("o1", "s1", "prometheus", prom_config())
            .await
            .unwrap();

        let deployed = h
            .service
            .notify_collector("o1", "s1", CollectorOperation::Deploy, Some(DeploymentStatus::Active), None)
            .await
            .unwrap();
        assert_eq!(deployed.collector_name.as_deref(), Some("otel-s1"));
        assert!(deployed.is_collector_running());
        assert_eq!(deployed.last_status, DeploymentStatus::Active);

        let deleted = h
            .service
            .notify_collector("o1", "s1", CollectorOperation::Delete, None, None)
            .await
            .unwrap();
        assert!(deleted.collector_name.is_none());
        assert!(!deleted.is_collector_running());
        assert_eq!(deleted.last_status, DeploymentStatus::Active);
        assert!(!h.cluster.has_workload("otel-s1"));
    }

    #[tokio::test]
    async fn test_redundant_deploy_does_not_reapply() {
        let h = harness();
        h.service
            .create_deployment("o1", "s1", "prometheus", prom_config())
            .await
            .unwrap();

        h.service
            .notify_collector("o1", "s1", CollectorOperation::Deploy, None, None)
            .await
            .unwrap();
        let applies = h.cluster.apply_count();
        h.service
            .notify_collector("o1", "s1", CollectorOperation::Deploy, None, None)
            .await
            .unwrap();
        assert_eq!(h.cluster.apply_count(), applies);
    }

    #[tokio::test]
    async fn test_deploy_failure_propagates() {
        let h = harness();
        h.cluster.fail_applies(ObjectKind::ConfigMap, "forbidden");
        h.service
            .create_deployment("o1", "s1", "prometheus", prom_config())
            .await
            .unwrap();

        let err = h
            .service
            .notify_collector("o1", "s1", CollectorOperation::Deploy, Some(DeploymentStatus::Active), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cluster);

        let stored = h.repo.get("o1", "s1").await.unwrap().unwrap();
        assert!(stored.collector_name.is_none());
        assert_eq!(stored.last_status, DeploymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_update_status_emits_event() {
        let h = harness();
        h.service
            .create_deployment("o1", "s1", "prometheus", prom_config())
            .await
            .unwrap();

        h.service
            .update_status("o1", "s1", DeploymentStatus::Error, Some("upstream said no"))
            .await
            .unwrap();
        let stored = h.repo.get("o1", "s1").await.unwrap().unwrap();
        assert_eq!(stored.last_status, DeploymentStatus::Error);
        assert_eq!(stored.last_error_message.as_deref(), Some("upstream said no"));

        let statuses = h.statuses().await;
        let last = statuses.last().unwrap();
        assert_eq!(last["status"], "error");
        assert_eq!(last["error_message"], "upstream said no");
    }

    #[tokio::test]
    async fn test_stale_hint_is_dropped() {
        let h = harness();
        h.service
            .create_deployment("o1", "s1", "prometheus", prom_config())
            .await
            .unwrap();

        // row written after the hint was issued
        h.repo
            .modify(
                "o1",
                "s1",
                Box::new(|row| {
                    row.set_status(DeploymentStatus::Active, None, Utc::now() + chrono::Duration::seconds(5));
                    true
                }),
            )
            .await
            .unwrap();

        h.service
            .submit_status_hint("o1", "s1", DeploymentStatus::Provisioning)
            .await
            .unwrap();

        let stored = h.repo.get("o1", "s1").await.unwrap().unwrap();
        assert_eq!(stored.last_status, DeploymentStatus::Active);
    }

    #[tokio::test]
    async fn test_fresh_hint_is_applied() {
        let h = harness();
        h.service
            .create_deployment("o1", "s1", "prometheus", prom_config())
            .await
            .unwrap();

        h.service
            .submit_status_hint("o1", "s1", DeploymentStatus::Provisioning)
            .await
            .unwrap();

        let stored = h.repo.get("o1", "s1").await.unwrap().unwrap();
        assert_eq!(stored.last_status, DeploymentStatus::Provisioning);
        assert_eq!(h.statuses().await.last().unwrap()["status"], "provisioning");
    }

    #[tokio::test]
    async fn test_remove_deployment() {
        let h = harness();
        h.service
            .create_deployment("o1", "s1", "prometheus", prom_config())
            .await
            .unwrap();

        h.service.remove_deployment("o1", "s1").await.unwrap();
        assert!(h.repo.is_empty());

        let err = h.service.remove_deployment("o1", "s1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_operations_are_metered() {
        let h = harness();
        h.service
            .create_deployment("o1", "s1", "prometheus", prom_config())
            .await
            .unwrap();
        let _ = h.service.get_deployment("o1", "missing").await;

        let create = h.service.metrics().operation("create_deployment").unwrap();
        assert_eq!(create.calls, 1);
        assert_eq!(create.failures, 0);
        let get = h.service.metrics().operation("get_deployment").unwrap();
        assert_eq!(get.failures, 1);
    }
}
