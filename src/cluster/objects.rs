//! Rendering of the three collector objects
//!
//! SBIO: Pure functions from `(spec, owner, sink, manifest)` to JSON
//! documents. Nothing here talks to the cluster.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::{ClusterObject, ObjectKind, HEALTH_PORT, METRICS_PORT};

/// Selector matching every collector workload this service manages
pub const COLLECTOR_SELECTOR: &str = "app=opentelemetry,component=otel-collector";

const CONFIG_KEY: &str = "config.yaml";
const CONFIG_MOUNT_PATH: &str = "/etc/otelcol";
const MAX_NAME_LEN: usize = 63;
const CONFIG_MAP_PREFIX: &str = "otel-collector-config-";
const WORKLOAD_PREFIX: &str = "otel-";
/// Longest slug that still fits behind the longest prefix
const MAX_SLUG_LEN: usize = MAX_NAME_LEN - CONFIG_MAP_PREFIX.len();
const DIGEST_LEN: usize = 8;

/// Settings shared by every collector workload
#[derive(Debug, Clone)]
pub struct CollectorSpec {
    pub namespace: String,
    pub image: String,
}

impl Default for CollectorSpec {
    fn default() -> Self {
        Self {
            namespace: "otelcollectors".to_string(),
            image: "otel/opentelemetry-collector-contrib:0.98.0".to_string(),
        }
    }
}

/// Lowercase and map anything outside `[a-z0-9-]` to `-`
pub fn sanitize_name(raw: &str) -> String {
    let mapped: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    mapped.trim_matches('-').to_string()
}

fn bounded(name: String) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    name[..MAX_NAME_LEN].trim_end_matches('-').to_string()
}

/// DNS-safe stand-in for a sink ID, used in object names and labels
///
/// IDs that are already safe and short enough are kept as they are. Any
/// other ID gets a digest of the raw ID appended, so two sinks never share
/// a slug just because they sanitize or truncate to the same text.
pub fn sink_slug(sink_id: &str) -> String {
    let clean = sanitize_name(sink_id);
    if clean == sink_id && clean.len() <= MAX_SLUG_LEN {
        return clean;
    }

    let digest = hex::encode(Sha256::digest(sink_id.as_bytes()));
    let digest = &digest[..DIGEST_LEN];
    let keep = MAX_SLUG_LEN - DIGEST_LEN - 1;
    let stem = clean[..clean.len().min(keep)].trim_end_matches('-');
    if stem.is_empty() {
        digest.to_string()
    } else {
        format!("{}-{}", stem, digest)
    }
}

/// Name of the workload and endpoint objects for a sink
pub fn workload_name(sink_id: &str) -> String {
    format!("{}{}", WORKLOAD_PREFIX, sink_slug(sink_id))
}

/// Name of the config object for a sink
pub fn config_map_name(sink_id: &str) -> String {
    format!("{}{}", CONFIG_MAP_PREFIX, sink_slug(sink_id))
}

/// Labels attached to all three objects
pub fn collector_labels(owner_id: &str, sink_id: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "opentelemetry".to_string());
    labels.insert("component".to_string(), "otel-collector".to_string());
    labels.insert("sink-id".to_string(), sink_slug(sink_id));
    labels.insert("owner-id".to_string(), bounded(sanitize_name(owner_id)));
    labels
}

fn selector_labels(sink_id: &str) -> Value {
    json!({
        "app": "opentelemetry",
        "component": "otel-collector",
        "sink-id": sink_slug(sink_id),
    })
}

/// Config holder carrying the rendered collector YAML
pub fn config_map(spec: &CollectorSpec, owner_id: &str, sink_id: &str, manifest: &str) -> ClusterObject {
    let name = config_map_name(sink_id);
    let body = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": name,
            "namespace": spec.namespace,
            "labels": collector_labels(owner_id, sink_id),
        },
        "data": {
            "config.yaml": manifest,
        },
    });
    ClusterObject { kind: ObjectKind::ConfigMap, name, body }
}

/// Single-replica collector workload mounting the config holder
pub fn deployment(spec: &CollectorSpec, owner_id: &str, sink_id: &str) -> ClusterObject {
    let name = workload_name(sink_id);
    let labels = collector_labels(owner_id, sink_id);
    let body = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "namespace": spec.namespace,
            "labels": labels,
        },
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": selector_labels(sink_id) },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "containers": [{
                        "name": "otel-collector",
                        "image": spec.image,
                        "args": [format!("--config={}/{}", CONFIG_MOUNT_PATH, CONFIG_KEY)],
                        "ports": [
                            { "name": "metrics", "containerPort": METRICS_PORT, "protocol": "TCP" },
                            { "name": "health", "containerPort": HEALTH_PORT, "protocol": "TCP" },
                        ],
                        "readinessProbe": {
                            "httpGet": { "path": "/", "port": HEALTH_PORT },
                        },
                        "volumeMounts": [{
                            "name": "collector-config",
                            "mountPath": CONFIG_MOUNT_PATH,
                        }],
                    }],
                    "volumes": [{
                        "name": "collector-config",
                        "configMap": {
                            "name": config_map_name(sink_id),
                            "items": [{ "key": CONFIG_KEY, "path": CONFIG_KEY }],
                        },
                    }],
                },
            },
        },
    });
    ClusterObject { kind: ObjectKind::Deployment, name, body }
}

/// Stable endpoint for the metrics and health ports
pub fn service(spec: &CollectorSpec, owner_id: &str, sink_id: &str) -> ClusterObject {
    let name = workload_name(sink_id);
    let body = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": name,
            "namespace": spec.namespace,
            "labels": collector_labels(owner_id, sink_id),
        },
        "spec": {
            "selector": selector_labels(sink_id),
            "ports": [
                { "name": "metrics", "port": METRICS_PORT, "targetPort": METRICS_PORT, "protocol": "TCP" },
                { "name": "health", "port": HEALTH_PORT, "targetPort": HEALTH_PORT, "protocol": "TCP" },
            ],
        },
    });
    ClusterObject { kind: ObjectKind::Service, name, body }
}

/// All three objects in apply order: config, workload, endpoint
pub fn collector_objects(
    spec: &CollectorSpec,
    owner_id: &str,
    sink_id: &str,
    manifest: &str,
) -> Vec<ClusterObject> {
    vec![
        config_map(spec, owner_id, sink_id, manifest),
        deployment(spec, owner_id, sink_id),
        service(spec, owner_id, sink_id),
    ]
}
