//! Stream events
//!
//! Inbound sink lifecycle and activity events, the outbound status-change
//! event, and the consumer machinery that drives the deployment service from
//! them. Events travel as flat string field maps, the shape stream entries
//! have on the wire.

pub mod consumer;
pub mod producer;
pub mod redis_stream;
pub mod stream;

pub use consumer::{
    Activity, ConsumerConfig, MessageHandler, PollReport, SinkActivityHandler, SinkLifecycleHandler,
    StreamConsumer,
};
pub use producer::StatusProducer;
pub use redis_stream::RedisStream;
pub use stream::{EventStream, MemoryStream, StreamError, StreamMessage};

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

use crate::config::{parse_config, ConfigMap};

/// Malformed stream events
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Missing event field: {0}")]
    MissingField(String),

    #[error("Invalid event field {0}: {1}")]
    InvalidField(String, String),
}

/// Flat field map of a stream entry
pub type Fields = HashMap<String, String>;

fn field<'a>(fields: &'a Fields, name: &str) -> Result<&'a str, EventError> {
    fields
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EventError::MissingField(name.to_string()))
}

fn field_any<'a>(fields: &'a Fields, names: &[&str]) -> Result<&'a str, EventError> {
    names
        .iter()
        .find_map(|n| fields.get(*n).map(String::as_str).filter(|v| !v.is_empty()))
        .ok_or_else(|| EventError::MissingField(names[0].to_string()))
}

/// Accepts RFC 3339 or unix seconds; a missing timestamp means now
pub fn parse_timestamp(fields: &Fields) -> Result<DateTime<Utc>, EventError> {
    let Some(raw) = fields.get("timestamp").filter(|v| !v.is_empty()) else {
        return Ok(Utc::now());
    };

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .ok_or_else(|| EventError::InvalidField("timestamp".to_string(), raw.clone()))
}

// ============================================================================
// Sink lifecycle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOperation {
    Create,
    Update,
    Delete,
}

impl FromStr for SinkOperation {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(EventError::InvalidField("operation".to_string(), other.to_string())),
        }
    }
}

impl fmt::Display for SinkOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Update => f.write_str("update"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// A sink was created, updated or deleted upstream
#[derive(Debug, Clone, PartialEq)]
pub struct SinkLifecycleEvent {
    pub sink_id: String,
    pub owner_id: String,
    pub backend: String,
    pub config: ConfigMap,
    pub operation: SinkOperation,
    pub timestamp: DateTime<Utc>,
}

impl SinkLifecycleEvent {
    pub fn from_fields(fields: &Fields) -> Result<Self, EventError> {
        let config = match fields.get("config") {
            Some(raw) => parse_config(raw)
                .map_err(|e| EventError::InvalidField("config".to_string(), e.to_string()))?,
            None => ConfigMap::new(),
        };

        Ok(Self {
            sink_id: field(fields, "sink_id")?.to_string(),
            owner_id: field_any(fields, &["owner", "owner_id"])?.to_string(),
            backend: fields.get("backend").cloned().unwrap_or_default(),
            config,
            operation: field(fields, "operation")?.parse()?,
            timestamp: parse_timestamp(fields)?,
        })
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("sink_id".to_string(), self.sink_id.clone()),
            ("owner".to_string(), self.owner_id.clone()),
            ("backend".to_string(), self.backend.clone()),
            (
                "config".to_string(),
                serde_json::Value::Object(self.config.clone()).to_string(),
            ),
            ("operation".to_string(), self.operation.to_string()),
            ("timestamp".to_string(), self.timestamp.to_rfc3339()),
        ]
    }
}

// ============================================================================
// Sink activity
// ============================================================================

/// A sink started or stopped receiving telemetry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkActivityEvent {
    pub sink_id: String,
    pub owner_id: String,
    /// Declared state, validated by the handler for its stream
    pub state: String,
    pub timestamp: DateTime<Utc>,
}

impl SinkActivityEvent {
    pub fn from_fields(fields: &Fields) -> Result<Self, EventError> {
        Ok(Self {
            sink_id: field(fields, "sink_id")?.to_string(),
            owner_id: field_any(fields, &["owner_id", "owner"])?.to_string(),
            state: fields.get("state").cloned().unwrap_or_default(),
            timestamp: parse_timestamp(fields)?,
        })
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("sink_id".to_string(), self.sink_id.clone()),
            ("owner_id".to_string(), self.owner_id.clone()),
            ("state".to_string(), self.state.clone()),
            ("timestamp".to_string(), self.timestamp.to_rfc3339()),
        ]
    }
}

// ============================================================================
// Status change (outbound)
// ============================================================================

/// Status value emitted for a freshly created deployment
pub const STATUS_UNKNOWN: &str = "unknown";

/// A deployment's status changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChangeEvent {
    pub owner_id: String,
    pub sink_id: String,
    pub status: String,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
}

impl StatusChangeEvent {
    pub fn new(owner_id: &str, sink_id: &str, status: &str, error_message: Option<&str>) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            sink_id: sink_id.to_string(),
            status: status.to_string(),
            error_message: error_message.unwrap_or_default().to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn from_fields(fields: &Fields) -> Result<Self, EventError> {
        Ok(Self {
            owner_id: field(fields, "owner_id")?.to_string(),
            sink_id: field(fields, "sink_id")?.to_string(),
            status: field(fields, "status")?.to_string(),
            error_message: fields.get("error_message").cloned().unwrap_or_default(),
            timestamp: parse_timestamp(fields)?,
        })
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("owner_id".to_string(), self.owner_id.clone()),
            ("sink_id".to_string(), self.sink_id.clone()),
            ("status".to_string(), self.status.clone()),
            ("error_message".to_string(), self.error_message.clone()),
            ("timestamp".to_string(), self.timestamp.to_rfc3339()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_lifecycle_event_from_fields() {
        let event = SinkLifecycleEvent::from_fields(&fields(&[
            ("sink_id", "s1"),
            ("owner", "o1"),
            ("backend", "prometheus"),
            ("config", r#"{"exporter": {"remote_host": "https://x"}}"#),
            ("operation", "create"),
            ("timestamp", "1700000000"),
        ]))
        .unwrap();

        assert_eq!(event.owner_id, "o1");
        assert_eq!(event.operation, SinkOperation::Create);
        assert_eq!(event.config["exporter"]["remote_host"], "https://x");
        assert_eq!(event.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_lifecycle_event_requires_operation() {
        let err = SinkLifecycleEvent::from_fields(&fields(&[("sink_id", "s1"), ("owner", "o1")]))
            .unwrap_err();
        assert_eq!(err, EventError::MissingField("operation".to_string()));

        let err = SinkLifecycleEvent::from_fields(&fields(&[
            ("sink_id", "s1"),
            ("owner", "o1"),
            ("operation", "rename"),
        ]))
        .unwrap_err();
        assert!(matches!(err, EventError::InvalidField(f, _) if f == "operation"));
    }

    #[test]
    fn test_lifecycle_event_bad_config() {
        let err = SinkLifecycleEvent::from_fields(&fields(&[
            ("sink_id", "s1"),
            ("owner", "o1"),
            ("operation", "update"),
            ("config", "{not json"),
        ]))
        .unwrap_err();
        assert!(matches!(err, EventError::InvalidField(f, _) if f == "config"));
    }

    #[test]
    fn test_activity_event_accepts_rfc3339() {
        let event = SinkActivityEvent::from_fields(&fields(&[
            ("sink_id", "s1"),
            ("owner_id", "o1"),
            ("state", "active"),
            ("timestamp", "2024-05-01T10:00:00Z"),
        ]))
        .unwrap();
        assert_eq!(event.state, "active");
        assert_eq!(event.timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn test_bad_timestamp() {
        let err = SinkActivityEvent::from_fields(&fields(&[
            ("sink_id", "s1"),
            ("owner_id", "o1"),
            ("timestamp", "yesterday"),
        ]))
        .unwrap_err();
        assert!(matches!(err, EventError::InvalidField(f, _) if f == "timestamp"));
    }

    #[test]
    fn test_status_event_fields() {
        let event = StatusChangeEvent::new("o1", "s1", "error", Some("boom"));
        let map: Fields = event.to_fields().into_iter().collect();

        assert_eq!(map["status"], "error");
        assert_eq!(map["error_message"], "boom");
        let parsed = StatusChangeEvent::from_fields(&map).unwrap();
        assert_eq!(parsed.sink_id, "s1");
        assert_eq!(parsed.error_message, "boom");
    }
}
