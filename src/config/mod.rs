//! Sink configuration handling
//!
//! A sink config is an untyped JSON object with two required namespaces,
//! `exporter` and `authentication`. It stays untyped while it is stored and
//! merged; the strategies in [`auth`] and [`exporter`] turn it into typed
//! variants at the point where a manifest is built.

pub mod auth;
pub mod builder;
pub mod cipher;
pub mod exporter;

pub use auth::{decrypt_secrets, encrypt_secrets, AuthStrategy};
pub use builder::{topic_for_sink, BuilderSettings, CollectorConfig, ConfigBuilder};
pub use cipher::{CipherError, CredentialCipher};
pub use exporter::ExporterStrategy;

use serde_json::{Map, Value};
use thiserror::Error;

/// Raw sink configuration
pub type ConfigMap = Map<String, Value>;

/// Unsupported or incomplete sink configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),

    #[error("Unsupported authentication type: {0}")]
    UnsupportedAuth(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field {0}: {1}")]
    InvalidField(String, String),

    #[error("Failed to render collector config: {0}")]
    Render(String),
}

// ============================================================================
// Field access
// ============================================================================

/// Fetch a non-empty string field, reporting `path` when it is missing
pub(crate) fn required_str<'a>(
    block: &'a ConfigMap,
    path: &str,
    key: &str,
) -> Result<&'a str, ConfigError> {
    match block.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(Value::String(_)) | Some(Value::Null) | None => {
            Err(ConfigError::MissingField(path.to_string()))
        }
        Some(_) => Err(ConfigError::InvalidField(
            path.to_string(),
            "expected a string".to_string(),
        )),
    }
}

/// Fetch a required top-level namespace
pub(crate) fn require_block<'a>(config: &'a ConfigMap, name: &str) -> Result<&'a ConfigMap, ConfigError> {
    match config.get(name) {
        Some(Value::Object(block)) => Ok(block),
        Some(Value::Null) | None => Err(ConfigError::MissingField(name.to_string())),
        Some(_) => Err(ConfigError::InvalidField(
            name.to_string(),
            "expected an object".to_string(),
        )),
    }
}

/// Parse a JSON document into a config object
pub fn parse_config(raw: &str) -> Result<ConfigMap, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(ConfigMap::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(ConfigMap::new()),
        Ok(_) => Err(ConfigError::InvalidField(
            "config".to_string(),
            "expected a JSON object".to_string(),
        )),
        Err(e) => Err(ConfigError::InvalidField("config".to_string(), e.to_string())),
    }
}

// ============================================================================
// Merge
// ============================================================================

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

fn auth_type(config: &ConfigMap) -> Option<&str> {
    config
        .get("authentication")
        .and_then(|a| a.get("type"))
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
}

fn merge_objects(base: &mut ConfigMap, overlay: &ConfigMap) {
    for (key, value) in overlay {
        if is_empty_value(value) {
            continue;
        }
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_objects(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Merge `overlay` into `base`
///
/// Non-empty values in `overlay` win; empty strings, nulls and empty objects
/// never erase what `base` holds. When `authentication.type` changes, the
/// authentication block is replaced rather than merged.
pub fn merge_config(base: &mut ConfigMap, overlay: &ConfigMap) {
    let replaces_auth = match (auth_type(base), auth_type(overlay)) {
        (Some(old), Some(new)) => old != new,
        _ => false,
    };

    if replaces_auth {
        if let Some(auth) = overlay.get("authentication") {
            base.insert("authentication".to_string(), auth.clone());
        }
        let mut rest = overlay.clone();
        rest.remove("authentication");
        merge_objects(base, &rest);
    } else {
        merge_objects(base, overlay);
    }
}
