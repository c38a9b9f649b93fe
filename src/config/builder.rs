//! Collector config builder
//!
//! Pure translation from `(sink id, backend, decrypted sink config)` to the
//! collector's YAML configuration: one Kafka receiver on the sink's topic,
//! the introspection extensions plus the resolved auth extension, the resolved
//! exporter, and a metrics pipeline wiring the two.

use serde::Serialize;
use serde_json::{json, Map, Value};

use super::auth::AuthStrategy;
use super::exporter::ExporterStrategy;
use super::{require_block, ConfigError, ConfigMap};

/// Prefix of the per-sink ingestion topic
pub const TOPIC_PREFIX: &str = "otlp_metrics";

const RECEIVER_NAME: &str = "kafka";
const PPROF_EXTENSION: &str = "pprof";
const HEALTH_EXTENSION: &str = "health_check";

/// Topic the collector for `sink_id` consumes from
pub fn topic_for_sink(sink_id: &str) -> String {
    format!("{}-{}", TOPIC_PREFIX, sink_id)
}

/// Settings shared by every rendered collector config
#[derive(Debug, Clone)]
pub struct BuilderSettings {
    pub kafka_brokers: Vec<String>,
    pub kafka_protocol_version: String,
    pub pprof_endpoint: String,
    pub health_endpoint: String,
    pub metrics_address: String,
    pub log_level: String,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            kafka_brokers: vec!["kafka:9092".to_string()],
            kafka_protocol_version: "2.0.0".to_string(),
            pprof_endpoint: "0.0.0.0:1888".to_string(),
            health_endpoint: "0.0.0.0:13133".to_string(),
            metrics_address: "0.0.0.0:8888".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Structured collector configuration, serialized to YAML by [`ConfigBuilder::render`]
#[derive(Debug, Clone, Serialize)]
pub struct CollectorConfig {
    pub receivers: Map<String, Value>,
    pub extensions: Map<String, Value>,
    pub exporters: Map<String, Value>,
    pub service: ServiceSection,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceSection {
    pub extensions: Vec<String>,
    pub pipelines: Pipelines,
    pub telemetry: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pipelines {
    pub metrics: PipelineSection,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSection {
    pub receivers: Vec<String>,
    pub exporters: Vec<String>,
}

/// Builds collector configs from sink configs
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    settings: BuilderSettings,
}

impl ConfigBuilder {
    pub fn new(settings: BuilderSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BuilderSettings {
        &self.settings
    }

    /// Resolve strategies and assemble the structured config
    pub fn build(
        &self,
        sink_id: &str,
        backend: &str,
        config: &ConfigMap,
    ) -> Result<CollectorConfig, ConfigError> {
        let auth = AuthStrategy::from_config(require_block(config, "authentication")?)?;
        let exporter = ExporterStrategy::from_config(backend, require_block(config, "exporter")?)?;

        let mut receivers = Map::new();
        receivers.insert(
            RECEIVER_NAME.to_string(),
            json!({
                "brokers": self.settings.kafka_brokers,
                "topic": topic_for_sink(sink_id),
                "protocol_version": self.settings.kafka_protocol_version,
            }),
        );

        let mut extensions = Map::new();
        extensions.insert(
            PPROF_EXTENSION.to_string(),
            json!({ "endpoint": self.settings.pprof_endpoint }),
        );
        extensions.insert(
            HEALTH_EXTENSION.to_string(),
            json!({ "endpoint": self.settings.health_endpoint }),
        );
        let mut extension_names = vec![PPROF_EXTENSION.to_string(), HEALTH_EXTENSION.to_string()];
        if let Some((name, block)) = auth.extension() {
            extension_names.push(name.clone());
            extensions.insert(name, block);
        }

        let mut exporters = Map::new();
        exporters.insert(
            exporter.exporter_name().to_string(),
            exporter.exporter(auth.extension_name()),
        );

        Ok(CollectorConfig {
            receivers,
            extensions,
            exporters,
            service: ServiceSection {
                extensions: extension_names,
                pipelines: Pipelines {
                    metrics: PipelineSection {
                        receivers: vec![RECEIVER_NAME.to_string()],
                        exporters: vec![exporter.exporter_name().to_string()],
                    },
                },
                telemetry: json!({
                    "metrics": { "address": self.settings.metrics_address },
                    "logs": { "level": self.settings.log_level },
                }),
            },
        })
    }

    /// Build and serialize to the collector's YAML format
    pub fn render(&self, sink_id: &str, backend: &str, config: &ConfigMap) -> Result<String, ConfigError> {
        let collector = self.build(sink_id, backend, config)?;
        serde_yaml::to_string(&collector).map_err(|e| ConfigError::Render(e.to_string()))
    }
}
