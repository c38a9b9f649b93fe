//! Exporter strategies, one per supported backend family

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use super::{required_str, ConfigError, ConfigMap};

pub const PROMETHEUS: &str = "prometheus";
pub const OTLP_HTTP: &str = "otlphttp";

/// Resolved exporter strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExporterStrategy {
    /// Prometheus remote-write, addressed by `exporter.remote_host`
    PrometheusRemoteWrite {
        endpoint: String,
        headers: BTreeMap<String, String>,
    },
    /// OTLP over HTTP, addressed by `exporter.endpoint`
    OtlpHttp {
        endpoint: String,
        headers: BTreeMap<String, String>,
    },
}

impl ExporterStrategy {
    /// Resolve the exporter for `backend` from the `exporter` block
    pub fn from_config(backend: &str, exporter: &ConfigMap) -> Result<Self, ConfigError> {
        match backend {
            PROMETHEUS => Ok(Self::PrometheusRemoteWrite {
                endpoint: required_str(exporter, "exporter.remote_host", "remote_host")?.to_string(),
                headers: parse_headers(exporter)?,
            }),
            OTLP_HTTP => Ok(Self::OtlpHttp {
                endpoint: required_str(exporter, "exporter.endpoint", "endpoint")?.to_string(),
                headers: parse_headers(exporter)?,
            }),
            other => Err(ConfigError::UnsupportedBackend(other.to_string())),
        }
    }

    /// Key under `exporters` in the collector config
    pub fn exporter_name(&self) -> &'static str {
        match self {
            Self::PrometheusRemoteWrite { .. } => "prometheusremotewrite",
            Self::OtlpHttp { .. } => "otlphttp",
        }
    }

    pub fn endpoint(&self) -> &str {
        match self {
            Self::PrometheusRemoteWrite { endpoint, .. } | Self::OtlpHttp { endpoint, .. } => endpoint,
        }
    }

    /// Exporter block, optionally wired to an auth extension
    pub fn exporter(&self, authenticator: Option<&str>) -> Value {
        let (endpoint, headers) = match self {
            Self::PrometheusRemoteWrite { endpoint, headers }
            | Self::OtlpHttp { endpoint, headers } => (endpoint, headers),
        };

        let mut block = Map::new();
        block.insert("endpoint".to_string(), json!(endpoint));
        if !headers.is_empty() {
            block.insert("headers".to_string(), json!(headers));
        }
        if let Some(name) = authenticator {
            block.insert("auth".to_string(), json!({ "authenticator": name }));
        }
        Value::Object(block)
    }
}

/// Custom headers are passed through verbatim, but must be string-valued
fn parse_headers(exporter: &ConfigMap) -> Result<BTreeMap<String, String>, ConfigError> {
    let Some(raw) = exporter.get("headers") else {
        return Ok(BTreeMap::new());
    };

    match raw {
        Value::Null => Ok(BTreeMap::new()),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k.clone(), s.clone())),
                _ => Err(ConfigError::InvalidField(
                    format!("exporter.headers.{}", k),
                    "header values must be strings".to_string(),
                )),
            })
            .collect(),
        _ => Err(ConfigError::InvalidField(
            "exporter.headers".to_string(),
            "expected an object".to_string(),
        )),
    }
}
