//! End-to-end flow over the in-memory adapters
//!
//! Lifecycle and activity entries are published onto streams, consumed
//! through the consumer groups, and checked against the repository, the
//! cluster and the outbound status stream.

use std::sync::Arc;
use std::time::Duration;

use maestro::cluster::{ClusterControl, ClusterControlConfig, CollectorSpec, MemoryCluster, ObjectKind};
use maestro::config::{ConfigBuilder, CredentialCipher};
use maestro::deployment::{DeploymentRepository, DeploymentService, DeploymentStatus, MemoryRepository};
use maestro::events::{
    Activity, ConsumerConfig, EventStream, MemoryStream, SinkActivityHandler, SinkLifecycleHandler, StatusProducer,
    StreamConsumer,
};
use maestro::metrics::ServiceMetrics;

const LIFECYCLE: &str = "sinks.lifecycle";
const ACTIVITY: &str = "sinks.activity";
const IDLE: &str = "sinks.idle";
const STATUS: &str = "sinks.status";

const PROM_CONFIG: &str = r#"{
    "exporter": {"remote_host": "https://acme.com/prom/push"},
    "authentication": {"type": "basicauth", "username": "prom-user", "password": "dbpass"}
}"#;

struct Pipeline {
    service: DeploymentService,
    repo: Arc<MemoryRepository>,
    cluster: Arc<MemoryCluster>,
    stream: Arc<MemoryStream>,
    lifecycle: StreamConsumer,
    active: StreamConsumer,
    idle: StreamConsumer,
}

fn consumer_config(stream: &str) -> ConsumerConfig {
    ConsumerConfig {
        block: Duration::ZERO,
        redelivery_idle: Duration::from_secs(60),
        ..ConsumerConfig::for_stream(stream, "maestro", "test-consumer")
    }
}

async fn pipeline() -> Pipeline {
    let repo = Arc::new(MemoryRepository::new());
    let cluster = Arc::new(MemoryCluster::new());
    let stream = Arc::new(MemoryStream::new());

    let control = ClusterControl::with_config(
        cluster.clone(),
        CollectorSpec::default(),
        ClusterControlConfig {
            lookup_attempts: 1,
            lookup_interval: Duration::ZERO,
            poll_attempts: 3,
            poll_interval: Duration::ZERO,
        },
    );
    let service = DeploymentService::new(
        repo.clone(),
        control,
        StatusProducer::new(stream.clone(), STATUS),
        ConfigBuilder::default(),
        CredentialCipher::new("integration-key"),
        Arc::new(ServiceMetrics::new()),
    );

    let lifecycle = StreamConsumer::new(
        stream.clone(),
        Arc::new(SinkLifecycleHandler::new(service.clone())),
        consumer_config(LIFECYCLE),
    );
    let active = StreamConsumer::new(
        stream.clone(),
        Arc::new(SinkActivityHandler::new(service.clone(), Activity::Active)),
        consumer_config(ACTIVITY),
    );
    let idle = StreamConsumer::new(
        stream.clone(),
        Arc::new(SinkActivityHandler::new(service.clone(), Activity::Idle)),
        consumer_config(IDLE),
    );
    for consumer in [&lifecycle, &active, &idle] {
        consumer.prepare().await.unwrap();
    }

    Pipeline {
        service,
        repo,
        cluster,
        stream,
        lifecycle,
        active,
        idle,
    }
}

fn entry(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn publish_lifecycle(p: &Pipeline, operation: &str, sink_id: &str, config: &str) {
    p.stream
        .publish(
            LIFECYCLE,
            &entry(&[
                ("sink_id", sink_id),
                ("owner", "tenant-1"),
                ("backend", "prometheus"),
                ("config", config),
                ("operation", operation),
                ("timestamp", "1714557600"),
            ]),
        )
        .await
        .unwrap();
}

async fn publish_activity(p: &Pipeline, stream: &str, sink_id: &str, state: &str) {
    p.stream
        .publish(
            stream,
            &entry(&[("sink_id", sink_id), ("owner_id", "tenant-1"), ("state", state)]),
        )
        .await
        .unwrap();
}

async fn statuses(p: &Pipeline, sink_id: &str) -> Vec<String> {
    p.stream
        .entries(STATUS)
        .await
        .into_iter()
        .filter(|f| f.get("sink_id").map(String::as_str) == Some(sink_id))
        .map(|f| f["status"].clone())
        .collect()
}

#[tokio::test]
async fn test_sink_lifecycle_end_to_end() {
    let p = pipeline().await;

    publish_lifecycle(&p, "create", "sink-id-11", PROM_CONFIG).await;
    let report = p.lifecycle.poll_once().await.unwrap();
    assert_eq!(report.acked, 1);

    let stored = p.repo.get("tenant-1", "sink-id-11").await.unwrap().unwrap();
    assert_eq!(stored.last_status, DeploymentStatus::Pending);
    assert_ne!(stored.config["authentication"]["password"], "dbpass");

    publish_activity(&p, ACTIVITY, "sink-id-11", "active").await;
    assert_eq!(p.active.poll_once().await.unwrap().acked, 1);

    assert!(p.cluster.has_workload("otel-sink-id-11"));
    let config_map = p
        .cluster
        .object(ObjectKind::ConfigMap, "otel-collector-config-sink-id-11")
        .unwrap();
    let manifest = config_map["data"]["config.yaml"].as_str().unwrap();
    assert!(manifest.contains("otlp_metrics-sink-id-11"));
    assert!(manifest.contains("password: dbpass"));

    let (deployment, _) = p.service.get_deployment("tenant-1", "sink-id-11").await.unwrap();
    assert_eq!(deployment.last_status, DeploymentStatus::Active);
    assert_eq!(deployment.collector_name.as_deref(), Some("otel-sink-id-11"));

    publish_activity(&p, IDLE, "sink-id-11", "idle").await;
    assert_eq!(p.idle.poll_once().await.unwrap().acked, 1);
    assert!(!p.cluster.has_workload("otel-sink-id-11"));

    publish_lifecycle(&p, "delete", "sink-id-11", "").await;
    assert_eq!(p.lifecycle.poll_once().await.unwrap().acked, 1);
    assert!(p.repo.is_empty());

    let seen = statuses(&p, "sink-id-11").await;
    assert_eq!(seen.first().map(String::as_str), Some("unknown"));
    assert!(seen.contains(&"active".to_string()));
    assert!(seen.contains(&"idle".to_string()));
}

#[tokio::test]
async fn test_out_of_order_update_creates_deployment() {
    let p = pipeline().await;

    publish_lifecycle(&p, "update", "s1", PROM_CONFIG).await;
    assert_eq!(p.lifecycle.poll_once().await.unwrap().acked, 1);
    assert!(p.repo.get("tenant-1", "s1").await.unwrap().is_some());

    publish_lifecycle(&p, "create", "s1", PROM_CONFIG).await;
    assert_eq!(p.lifecycle.poll_once().await.unwrap().acked, 1);
    assert_eq!(p.repo.len(), 1);
}

#[tokio::test]
async fn test_partial_update_preserves_credentials() {
    let p = pipeline().await;

    publish_lifecycle(&p, "create", "s1", PROM_CONFIG).await;
    p.lifecycle.poll_once().await.unwrap();
    publish_lifecycle(&p, "update", "s1", r#"{"exporter": {"remote_host": "https://new.example.com"}}"#).await;
    p.lifecycle.poll_once().await.unwrap();

    let (deployment, manifest) = p.service.get_deployment("tenant-1", "s1").await.unwrap();
    assert_eq!(deployment.last_status, DeploymentStatus::Provisioning);
    assert_eq!(deployment.config["authentication"]["username"], "prom-user");
    assert_eq!(deployment.config["authentication"]["password"], "dbpass");
    assert!(manifest.contains("https://new.example.com"));
}

#[tokio::test]
async fn test_unsupported_backend_surfaces_provisioning_error() {
    let p = pipeline().await;

    p.stream
        .publish(
            LIFECYCLE,
            &entry(&[
                ("sink_id", "s1"),
                ("owner", "tenant-1"),
                ("backend", "datadog"),
                ("config", PROM_CONFIG),
                ("operation", "create"),
            ]),
        )
        .await
        .unwrap();
    assert_eq!(p.lifecycle.poll_once().await.unwrap().acked, 1);

    let stored = p.repo.get("tenant-1", "s1").await.unwrap().unwrap();
    assert_eq!(stored.last_status, DeploymentStatus::ProvisioningError);
    assert_eq!(statuses(&p, "s1").await, vec!["provisioning_error"]);

    publish_activity(&p, ACTIVITY, "s1", "active").await;
    assert_eq!(p.active.poll_once().await.unwrap().acked, 1);
    assert_eq!(p.cluster.workload_count(), 0);
    let stored = p.repo.get("tenant-1", "s1").await.unwrap().unwrap();
    assert_eq!(stored.last_status, DeploymentStatus::ProvisioningError);
}

#[tokio::test]
async fn test_rejected_activity_stays_pending() {
    let p = pipeline().await;

    publish_lifecycle(&p, "create", "s1", PROM_CONFIG).await;
    p.lifecycle.poll_once().await.unwrap();
    publish_activity(&p, ACTIVITY, "s1", "deleted").await;

    let report = p.active.poll_once().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(p.stream.pending_count(ACTIVITY, "maestro").await, 1);
    assert_eq!(p.cluster.apply_count(), 0);
    assert_eq!(statuses(&p, "s1").await, vec!["unknown"]);
}

#[tokio::test]
async fn test_redundant_activity_applies_once() {
    let p = pipeline().await;

    publish_lifecycle(&p, "create", "s1", PROM_CONFIG).await;
    p.lifecycle.poll_once().await.unwrap();

    publish_activity(&p, ACTIVITY, "s1", "active").await;
    publish_activity(&p, ACTIVITY, "s1", "active").await;
    let report = p.active.poll_once().await.unwrap();

    assert_eq!(report.acked, 2);
    assert_eq!(p.cluster.workload_count(), 1);
    assert_eq!(p.cluster.apply_count(), 3);
}
