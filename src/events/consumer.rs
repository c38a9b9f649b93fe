//! Stream consumers
//!
//! [`StreamConsumer`] owns the consumer-group loop for one inbound stream and
//! hands each entry to a [`MessageHandler`]. An entry is acknowledged only
//! when its handler returns `Ok`; anything else stays pending and is claimed
//! again once it has been idle for `redelivery_idle`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::stream::{EventStream, StreamError, StreamMessage};
use super::{SinkActivityEvent, SinkLifecycleEvent, SinkOperation};
use crate::deployment::{CollectorOperation, Deployment, DeploymentError, DeploymentService, DeploymentStatus, ErrorKind};

/// Handles one stream entry; `Ok` means the entry may be acknowledged
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &StreamMessage) -> Result<(), DeploymentError>;
}

/// Consumer-group settings for one stream
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    /// Maximum entries per read
    pub batch_size: usize,
    /// How long a read waits for new entries
    pub block: Duration,
    /// Pending entries idle this long are claimed for redelivery
    pub redelivery_idle: Duration,
    /// Back-off after a failed read
    pub error_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream: "sinks.lifecycle".to_string(),
            group: "maestro".to_string(),
            consumer: "maestro-0".to_string(),
            batch_size: 10,
            block: Duration::from_secs(2),
            redelivery_idle: Duration::from_secs(30),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl ConsumerConfig {
    pub fn for_stream(stream: impl Into<String>, group: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            ..Default::default()
        }
    }
}

/// Outcome of one poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub received: usize,
    pub acked: usize,
    pub failed: usize,
}

/// Consumer-group loop over one stream
pub struct StreamConsumer {
    stream: Arc<dyn EventStream>,
    handler: Arc<dyn MessageHandler>,
    config: ConsumerConfig,
}

impl StreamConsumer {
    pub fn new(stream: Arc<dyn EventStream>, handler: Arc<dyn MessageHandler>, config: ConsumerConfig) -> Self {
        Self {
            stream,
            handler,
            config,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Create the consumer group if it does not exist yet
    pub async fn prepare(&self) -> Result<(), StreamError> {
        self.stream
            .ensure_group(&self.config.stream, &self.config.group)
            .await
    }

    /// Reclaim idle pending entries, read new ones, and handle both
    pub async fn poll_once(&self) -> Result<PollReport, StreamError> {
        let cfg = &self.config;

        let mut messages = self
            .stream
            .claim_pending(&cfg.stream, &cfg.group, &cfg.consumer, cfg.redelivery_idle, cfg.batch_size)
            .await?;
        if !messages.is_empty() {
            info!("Reclaimed {} pending entries on {}", messages.len(), cfg.stream);
        }

        let block = if messages.is_empty() { cfg.block } else { Duration::ZERO };
        messages.extend(
            self.stream
                .read_group(&cfg.stream, &cfg.group, &cfg.consumer, cfg.batch_size, block)
                .await?,
        );

        let mut report = PollReport {
            received: messages.len(),
            ..Default::default()
        };
        for message in &messages {
            match self.handler.handle(message).await {
                Ok(()) => {
                    self.stream.ack(&cfg.stream, &cfg.group, &message.id).await?;
                    report.acked += 1;
                }
                Err(e) => {
                    warn!(
                        "Entry {} on {} not acknowledged, left for redelivery: {}",
                        message.id, cfg.stream, e
                    );
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Poll until `shutdown` fires
    ///
    /// Shutdown is only observed between polls, so a batch in flight is never
    /// cut short. The read block bounds how long that takes.
    pub async fn run(self, shutdown: watch::Receiver<()>) {
        let cfg = self.config.clone();
        info!("Consumer {} started on {} (group {})", cfg.consumer, cfg.stream, cfg.group);

        // A dropped sender counts as shutdown
        while !shutdown.has_changed().unwrap_or(true) {
            match self.poll_once().await {
                Ok(report) if report.received > 0 => debug!(
                    "{}: {} received, {} acked, {} failed",
                    cfg.stream, report.received, report.acked, report.failed
                ),
                Ok(_) => {}
                Err(e) => {
                    error!("Read from {} failed: {}", cfg.stream, e);
                    sleep(cfg.error_backoff).await;
                }
            }
        }
        info!("Consumer on {} shutting down", cfg.stream);
    }
}

// ============================================================================
// Sink lifecycle
// ============================================================================

/// Applies sink create/update/delete events to deployments
pub struct SinkLifecycleHandler {
    service: DeploymentService,
}

impl SinkLifecycleHandler {
    pub fn new(service: DeploymentService) -> Self {
        Self { service }
    }

    async fn on_create(&self, event: SinkLifecycleEvent) -> Result<(), DeploymentError> {
        match self
            .service
            .create_deployment(&event.owner_id, &event.sink_id, &event.backend, event.config)
            .await
        {
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                info!(
                    "Deployment for {}/{} already exists, treating create as applied",
                    event.owner_id, event.sink_id
                );
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn on_update(&self, event: SinkLifecycleEvent) -> Result<(), DeploymentError> {
        if !self.service.deployment_exists(&event.owner_id, &event.sink_id).await? {
            info!(
                "Update for unknown deployment {}/{}, creating it",
                event.owner_id, event.sink_id
            );
            return self.on_create(event).await;
        }

        let update = Deployment::new(event.owner_id, event.sink_id, event.backend, event.config);
        match self.service.update_deployment(update).await {
            // already recorded as provisioning_error; redelivery cannot help
            Err(e) if e.kind() == ErrorKind::Cipher => {
                warn!("Update left deployment in provisioning_error: {}", e);
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn on_delete(&self, event: SinkLifecycleEvent) -> Result<(), DeploymentError> {
        let owner = &event.owner_id;
        let sink = &event.sink_id;

        if !self.service.deployment_exists(owner, sink).await? {
            warn!("Delete for unknown deployment {}/{}, skipping", owner, sink);
            return Ok(());
        }

        self.service.cluster().delete(owner, sink).await?;
        self.service.remove_deployment(owner, sink).await
    }
}

#[async_trait]
impl MessageHandler for SinkLifecycleHandler {
    async fn handle(&self, message: &StreamMessage) -> Result<(), DeploymentError> {
        let event = SinkLifecycleEvent::from_fields(&message.fields)?;
        debug!(
            "Sink {} for {}/{} ({})",
            event.operation, event.owner_id, event.sink_id, message.id
        );

        match event.operation {
            SinkOperation::Create => self.on_create(event).await,
            SinkOperation::Update => self.on_update(event).await,
            SinkOperation::Delete => self.on_delete(event).await,
        }
    }
}

// ============================================================================
// Sink activity
// ============================================================================

/// Which activity stream a handler serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Active,
    Idle,
}

impl Activity {
    pub fn state(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
        }
    }

    /// Hint fired before the collector action
    fn hint(&self) -> DeploymentStatus {
        match self {
            Self::Active => DeploymentStatus::Provisioning,
            Self::Idle => DeploymentStatus::Idle,
        }
    }

    fn operation(&self) -> CollectorOperation {
        match self {
            Self::Active => CollectorOperation::Deploy,
            Self::Idle => CollectorOperation::Delete,
        }
    }

    /// Authoritative status once the collector action succeeded
    fn settled(&self) -> DeploymentStatus {
        match self {
            Self::Active => DeploymentStatus::Active,
            Self::Idle => DeploymentStatus::Idle,
        }
    }
}

/// Deploys or tears down collectors as sinks become active or idle
pub struct SinkActivityHandler {
    service: DeploymentService,
    activity: Activity,
}

impl SinkActivityHandler {
    pub fn new(service: DeploymentService, activity: Activity) -> Self {
        Self { service, activity }
    }
}

#[async_trait]
impl MessageHandler for SinkActivityHandler {
    async fn handle(&self, message: &StreamMessage) -> Result<(), DeploymentError> {
        let event = SinkActivityEvent::from_fields(&message.fields)?;
        let expected = self.activity.state();
        if event.state != expected {
            return Err(DeploymentError::Validation(format!(
                "unexpected sink state '{}' for {}/{}, expected '{}'",
                event.state, event.owner_id, event.sink_id, expected
            )));
        }

        let owner = &event.owner_id;
        let sink = &event.sink_id;
        self.service.submit_status_hint(owner, sink, self.activity.hint());

        let result = self
            .service
            .notify_collector(owner, sink, self.activity.operation(), Some(self.activity.settled()), None)
            .await;

        if let Err(e) = result {
            warn!("Sink {} {}/{} failed: {}", expected, owner, sink, e);
            let message = e.tenant_message();
            if let Err(e2) = self
                .service
                .update_status(owner, sink, DeploymentStatus::ProvisioningError, Some(&message))
                .await
            {
                error!(
                    "Failed to record provisioning error for {}/{}: {}",
                    owner, sink, e2
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterControl, ClusterControlConfig, CollectorSpec, MemoryCluster, ObjectKind};
    use crate::config::{ConfigBuilder, CredentialCipher};
    use crate::deployment::{DeploymentRepository, MemoryRepository};
    use crate::events::{Fields, MemoryStream, StatusProducer};
    use crate::metrics::ServiceMetrics;

    struct Harness {
        service: DeploymentService,
        repo: Arc<MemoryRepository>,
        cluster: Arc<MemoryCluster>,
        stream: Arc<MemoryStream>,
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
            StatusProducer::new(stream.clone(), "sinks.status"),
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

    const CONFIG: &str = r#"{"exporter": {"remote_host": "https://acme.com/prom/push"},
        "authentication": {"type": "basicauth", "username": "u", "password": "p"}}"#;

    fn message(pairs: &[(&str, &str)]) -> StreamMessage {
        let fields: Fields = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        StreamMessage {
            id: "1-0".to_string(),
            fields,
        }
    }

    fn lifecycle(operation: &str, config: &str) -> StreamMessage {
        message(&[
            ("sink_id", "s1"),
            ("owner", "o1"),
            ("backend", "prometheus"),
            ("config", config),
            ("operation", operation),
        ])
    }

    fn activity(state: &str) -> StreamMessage {
        message(&[("sink_id", "s1"), ("owner_id", "o1"), ("state", state)])
    }

    #[tokio::test]
    async fn test_create_then_duplicate_create() {
        let h = harness();
        let handler = SinkLifecycleHandler::new(h.service.clone());

        handler.handle(&lifecycle("create", CONFIG)).await.unwrap();
        handler.handle(&lifecycle("create", CONFIG)).await.unwrap();
        assert_eq!(h.repo.len(), 1);
    }

    #[tokio::test]
    async fn test_update_before_create_creates() {
        let h = harness();
        let handler = SinkLifecycleHandler::new(h.service.clone());

        handler.handle(&lifecycle("update", CONFIG)).await.unwrap();
        let stored = h.repo.get("o1", "s1").await.unwrap().unwrap();
        assert_eq!(stored.backend, "prometheus");
    }

    #[tokio::test]
    async fn test_update_existing_marks_provisioning() {
        let h = harness();
        let handler = SinkLifecycleHandler::new(h.service.clone());

        handler.handle(&lifecycle("create", CONFIG)).await.unwrap();
        handler
            .handle(&lifecycle("update", r#"{"exporter": {"remote_host": "https://b"}}"#))
            .await
            .unwrap();

        let (deployment, _) = h.service.get_deployment("o1", "s1").await.unwrap();
        assert_eq!(deployment.last_status, DeploymentStatus::Provisioning);
        assert_eq!(deployment.config["exporter"]["remote_host"], "https://b");
        assert_eq!(deployment.config["authentication"]["password"], "p");
    }

    #[tokio::test]
    async fn test_update_with_unreadable_credentials_is_acked() {
        let h = harness();
        let handler = SinkLifecycleHandler::new(h.service.clone());
        handler.handle(&lifecycle("create", CONFIG)).await.unwrap();
        h.repo
            .modify(
                "o1",
                "s1",
                Box::new(|row| {
                    row.config["authentication"]["password"] = serde_json::json!("00ff");
                    true
                }),
            )
            .await
            .unwrap();

        handler
            .handle(&lifecycle("update", r#"{"exporter": {"remote_host": "https://b"}}"#))
            .await
            .unwrap();

        let stored = h.repo.get("o1", "s1").await.unwrap().unwrap();
        assert_eq!(stored.last_status, DeploymentStatus::ProvisioningError);
        assert_eq!(h.repo.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_with_unreadable_credentials_still_removes() {
        let h = harness();
        let handler = SinkLifecycleHandler::new(h.service.clone());
        handler.handle(&lifecycle("create", CONFIG)).await.unwrap();
        h.repo
            .modify(
                "o1",
                "s1",
                Box::new(|row| {
                    row.config["authentication"]["password"] = serde_json::json!("00ff");
                    true
                }),
            )
            .await
            .unwrap();

        handler.handle(&lifecycle("delete", "")).await.unwrap();
        assert!(h.repo.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_is_skipped() {
        let h = harness();
        let handler = SinkLifecycleHandler::new(h.service.clone());
        handler.handle(&lifecycle("delete", "")).await.unwrap();
        assert_eq!(h.cluster.delete_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_tears_down_and_removes() {
        let h = harness();
        let lifecycle_handler = SinkLifecycleHandler::new(h.service.clone());
        let active = SinkActivityHandler::new(h.service.clone(), Activity::Active);

        lifecycle_handler.handle(&lifecycle("create", CONFIG)).await.unwrap();
        active.handle(&activity("active")).await.unwrap();
        assert!(h.cluster.has_workload("otel-s1"));

        lifecycle_handler.handle(&lifecycle("delete", "")).await.unwrap();
        assert!(!h.cluster.has_workload("otel-s1"));
        assert!(h.repo.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_lifecycle_event_fails() {
        let h = harness();
        let handler = SinkLifecycleHandler::new(h.service.clone());
        let err = handler
            .handle(&message(&[("sink_id", "s1"), ("owner", "o1")]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_activity_deploys_collector() {
        let h = harness();
        h.service
            .create_deployment("o1", "s1", "prometheus", crate::config::parse_config(CONFIG).unwrap())
            .await
            .unwrap();

        let handler = SinkActivityHandler::new(h.service.clone(), Activity::Active);
        handler.handle(&activity("active")).await.unwrap();

        let stored = h.repo.get("o1", "s1").await.unwrap().unwrap();
        assert_eq!(stored.collector_name.as_deref(), Some("otel-s1"));
        assert!(h.cluster.has_workload("otel-s1"));
    }

    #[tokio::test]
    async fn test_wrong_state_is_rejected_without_status_change() {
        let h = harness();
        h.service
            .create_deployment("o1", "s1", "prometheus", crate::config::parse_config(CONFIG).unwrap())
            .await
            .unwrap();
        let before = h.stream.entries("sinks.status").await.len();

        let handler = SinkActivityHandler::new(h.service.clone(), Activity::Active);
        let err = handler.handle(&activity("paused")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let stored = h.repo.get("o1", "s1").await.unwrap().unwrap();
        assert_eq!(stored.last_status, DeploymentStatus::Pending);
        assert_eq!(h.stream.entries("sinks.status").await.len(), before);
        assert_eq!(h.cluster.apply_count(), 0);
    }

    #[tokio::test]
    async fn test_deploy_failure_records_provisioning_error() {
        let h = harness();
        h.cluster.fail_applies(ObjectKind::Deployment, "quota exceeded");
        h.service
            .create_deployment("o1", "s1", "prometheus", crate::config::parse_config(CONFIG).unwrap())
            .await
            .unwrap();

        let handler = SinkActivityHandler::new(h.service.clone(), Activity::Active);
        handler.handle(&activity("active")).await.unwrap();

        let stored = h.repo.get("o1", "s1").await.unwrap().unwrap();
        assert_eq!(stored.last_status, DeploymentStatus::ProvisioningError);
        assert_eq!(stored.last_error_message.as_deref(), Some("failed to deploy collector"));
    }

    #[tokio::test]
    async fn test_activity_for_missing_deployment_is_acked() {
        let h = harness();
        let handler = SinkActivityHandler::new(h.service.clone(), Activity::Active);
        // secondary status write fails too, and is only logged
        handler.handle(&activity("active")).await.unwrap();
        assert!(h.repo.is_empty());
    }

    #[tokio::test]
    async fn test_idle_tears_down() {
        let h = harness();
        h.service
            .create_deployment("o1", "s1", "prometheus", crate::config::parse_config(CONFIG).unwrap())
            .await
            .unwrap();
        SinkActivityHandler::new(h.service.clone(), Activity::Active)
            .handle(&activity("active"))
            .await
            .unwrap();

        SinkActivityHandler::new(h.service.clone(), Activity::Idle)
            .handle(&activity("idle"))
            .await
            .unwrap();

        let stored = h.repo.get("o1", "s1").await.unwrap().unwrap();
        assert!(stored.collector_name.is_none());
        assert_eq!(stored.last_status, DeploymentStatus::Idle);
        assert!(!h.cluster.has_workload("otel-s1"));
    }

    struct FailingHandler;

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle(&self, _message: &StreamMessage) -> Result<(), DeploymentError> {
            Err(DeploymentError::Validation("nope".to_string()))
        }
    }

    #[tokio::test]
    async fn test_poll_acks_only_successes() {
        let h = harness();
        let config = ConsumerConfig {
            block: Duration::ZERO,
            redelivery_idle: Duration::from_secs(60),
            ..ConsumerConfig::for_stream("sinks.lifecycle", "g", "c1")
        };
        let consumer = StreamConsumer::new(
            h.stream.clone(),
            Arc::new(SinkLifecycleHandler::new(h.service.clone())),
            config.clone(),
        );
        consumer.prepare().await.unwrap();

        h.stream
            .publish("sinks.lifecycle", &[
                ("sink_id".to_string(), "s1".to_string()),
                ("owner".to_string(), "o1".to_string()),
                ("backend".to_string(), "prometheus".to_string()),
                ("config".to_string(), CONFIG.to_string()),
                ("operation".to_string(), "create".to_string()),
            ])
            .await
            .unwrap();
        h.stream
            .publish("sinks.lifecycle", &[("sink_id".to_string(), "s2".to_string())])
            .await
            .unwrap();

        let report = consumer.poll_once().await.unwrap();
        assert_eq!(report, PollReport { received: 2, acked: 1, failed: 1 });
        assert_eq!(h.stream.pending_count("sinks.lifecycle", "g").await, 1);
    }

    #[tokio::test]
    async fn test_failed_entry_is_redelivered() {
        let stream = Arc::new(MemoryStream::new());
        let config = ConsumerConfig {
            block: Duration::ZERO,
            redelivery_idle: Duration::ZERO,
            ..ConsumerConfig::for_stream("s", "g", "c1")
        };
        let consumer = StreamConsumer::new(stream.clone(), Arc::new(FailingHandler), config);
        consumer.prepare().await.unwrap();
        let id = stream
            .publish("s", &[("k".to_string(), "v".to_string())])
            .await
            .unwrap();

        consumer.poll_once().await.unwrap();
        let report = consumer.poll_once().await.unwrap();

        assert_eq!(report.received, 1);
        assert_eq!(stream.delivery_count("s", "g", &id).await, 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let stream = Arc::new(MemoryStream::new());
        let config = ConsumerConfig {
            block: Duration::from_millis(10),
            ..ConsumerConfig::for_stream("s", "g", "c1")
        };
        let consumer = StreamConsumer::new(stream, Arc::new(FailingHandler), config);
        consumer.prepare().await.unwrap();

        let (tx, rx) = watch::channel(());
        let handle = tokio::spawn(consumer.run(rx));
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
