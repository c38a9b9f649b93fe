//! Tenant sink registry
//!
//! Read-only view of the tenant sink roster, used by the monitor to match
//! running collectors to sinks. The orchestrator never writes to it.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::ConfigMap;

// ============================================================================
// Data structures (pure, no I/O)
// ============================================================================

/// A sink as the registry reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkSummary {
    pub id: String,
    #[serde(alias = "owner")]
    pub owner_id: String,
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub config: ConfigMap,
    /// Last status the tenant surface shows for this sink
    #[serde(default)]
    pub state: String,
}

impl SinkSummary {
    pub fn new(id: &str, owner_id: &str, backend: &str, state: &str) -> Self {
        Self {
            id: id.to_string(),
            owner_id: owner_id.to_string(),
            backend: backend.to_string(),
            config: ConfigMap::new(),
            state: state.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON parse error: {0}")]
    Parse(String),

    #[error("Registry error: {status} - {message}")]
    Api { status: u16, message: String },
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait SinkRegistry: Send + Sync {
    /// Sinks with telemetry export enabled
    async fn list_export_enabled(&self) -> Result<Vec<SinkSummary>, RegistryError>;

    async fn get_sink(&self, sink_id: &str) -> Result<Option<SinkSummary>, RegistryError>;
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

#[derive(Clone)]
pub struct HttpSinkRegistry {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpSinkRegistry {
    pub fn new(base_url: String, api_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn fetch(&self, url: &str) -> Result<reqwest::Response, RegistryError> {
        let mut req = self.client.get(url);
        if let Some(ref token) = self.api_token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        req.send().await.map_err(|e| RegistryError::Http(e.to_string()))
    }
}

async fn api_error(response: reqwest::Response) -> RegistryError {
    let status = response.status().as_u16();
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    RegistryError::Api { status, message }
}

#[async_trait]
impl SinkRegistry for HttpSinkRegistry {
    async fn list_export_enabled(&self) -> Result<Vec<SinkSummary>, RegistryError> {
        let response = self.fetch(&self.url("/sinks?export_enabled=true")).await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let sinks: Vec<SinkSummary> = response
            .json()
            .await
            .map_err(|e| RegistryError::Parse(e.to_string()))?;
        debug!("Registry returned {} export-enabled sinks", sinks.len());
        Ok(sinks)
    }

    async fn get_sink(&self, sink_id: &str) -> Result<Option<SinkSummary>, RegistryError> {
        let response = self.fetch(&self.url(&format!("/sinks/{}", sink_id))).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let sink: SinkSummary = response
            .json()
            .await
            .map_err(|e| RegistryError::Parse(e.to_string()))?;
        Ok(Some(sink))
    }
}

// ============================================================================
// In-memory registry
// ============================================================================

/// Registry backed by a map, for tests and local runs
#[derive(Debug, Default)]
pub struct MemorySinkRegistry {
    sinks: DashMap<String, (SinkSummary, bool)>,
}

impl MemorySinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, sink: SinkSummary, export_enabled: bool) {
        self.sinks.insert(sink.id.clone(), (sink, export_enabled));
    }

    pub fn set_state(&self, sink_id: &str, state: &str) {
        if let Some(mut entry) = self.sinks.get_mut(sink_id) {
            entry.0.state = state.to_string();
        }
    }

    pub fn remove(&self, sink_id: &str) {
        self.sinks.remove(sink_id);
    }
}

#[async_trait]
impl SinkRegistry for MemorySinkRegistry {
    async fn list_export_enabled(&self) -> Result<Vec<SinkSummary>, RegistryError> {
        let mut sinks: Vec<SinkSummary> = self
            .sinks
            .iter()
            .filter(|r| r.1)
            .map(|r| r.0.clone())
            .collect();
        sinks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sinks)
    }

    async fn get_sink(&self, sink_id: &str) -> Result<Option<SinkSummary>, RegistryError> {
        Ok(self.sinks.get(sink_id).map(|r| r.0.clone()))
    }
}
