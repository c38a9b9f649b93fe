//! Collector log classification
//!
//! SBIO: Pure functions, no I/O. Turns a window of collector log lines into
//! the status the tenant should see.

use serde_json::Value;

use crate::deployment::DeploymentStatus;

/// Upstream failures reported as `error`, with the message shown to the tenant
const ERROR_MARKERS: &[(&str, &str)] = &[
    (
        "401 Unauthorized",
        "error: remote write returned HTTP status 401 Unauthorized, check your credentials",
    ),
    (
        "404 Not Found",
        "error: remote write returned HTTP status 404 Not Found, check your endpoint",
    ),
    (
        "502 Bad Gateway",
        "error: remote write returned HTTP status 502 Bad Gateway",
    ),
    (
        "504 Gateway Timeout",
        "error: remote write returned HTTP status 504 Gateway Timeout",
    ),
];

/// Upstream responses reported as `warning`
const WARNING_MARKERS: &[&str] = &["429 Too Many Requests", "400 Bad Request"];

const ERROR_TOKEN: &str = "error";

/// Fields a structured collector log line carries before its JSON payload
const MIN_STRUCTURED_FIELDS: usize = 5;

const GENERIC_ERROR: &str = "error: the collector reported an error, review your sink parameters";

/// Outcome of classifying a log window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Active,
    Warning(String),
    Error(String),
    /// The logs could not be interpreted; never written as a status
    Fail(String),
}

impl Classification {
    /// Status to record, or `None` for [`Classification::Fail`]
    pub fn status(&self) -> Option<(DeploymentStatus, Option<&str>)> {
        match self {
            Self::Active => Some((DeploymentStatus::Active, None)),
            Self::Warning(msg) => Some((DeploymentStatus::Warning, Some(msg.as_str()))),
            Self::Error(msg) => Some((DeploymentStatus::Error, Some(msg.as_str()))),
            Self::Fail(_) => None,
        }
    }
}

/// Classify one line, or `None` if it says nothing about health
pub fn classify_line(line: &str) -> Option<Classification> {
    if let Some((_, message)) = ERROR_MARKERS.iter().find(|(marker, _)| line.contains(marker)) {
        return Some(Classification::Error(message.to_string()));
    }
    if let Some(marker) = WARNING_MARKERS.iter().find(|marker| line.contains(*marker)) {
        return Some(Classification::Warning(format!(
            "warning: remote write returned HTTP status {}",
            marker
        )));
    }
    if !line.contains(ERROR_TOKEN) {
        return None;
    }

    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < MIN_STRUCTURED_FIELDS {
        return Some(Classification::Error(GENERIC_ERROR.to_string()));
    }

    let payload = fields[fields.len() - 1].trim();
    match serde_json::from_str::<Value>(payload) {
        Ok(json) => match json.get(ERROR_TOKEN).and_then(Value::as_str) {
            Some(message) => Some(Classification::Error(format!("error: {}", message))),
            None => Some(Classification::Error(GENERIC_ERROR.to_string())),
        },
        Err(e) => Some(Classification::Fail(format!("unparseable log payload: {}", e))),
    }
}

/// Classify a log window; the most recent meaningful line decides
pub fn classify_logs<S: AsRef<str>>(lines: &[S]) -> Classification {
    lines
        .iter()
        .rev()
        .find_map(|line| classify_line(line.as_ref()))
        .unwrap_or(Classification::Active)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_is_error() {
        let result = classify_logs(&["2024-05-01T10:00:00Z\twarn\tPermanent error: 401 Unauthorized"]);
        assert_eq!(
            result,
            Classification::Error(
                "error: remote write returned HTTP status 401 Unauthorized, check your credentials"
                    .to_string()
            )
        );
    }

    #[test]
    fn test_gateway_errors() {
        assert!(matches!(
            classify_line("upstream 502 Bad Gateway"),
            Some(Classification::Error(m)) if m.contains("502")
        ));
        assert!(matches!(
            classify_line("upstream 504 Gateway Timeout"),
            Some(Classification::Error(m)) if m.contains("504")
        ));
    }

    #[test]
    fn test_throttling_is_warning() {
        let result = classify_logs(&["remote write: 429 Too Many Requests"]);
        assert!(matches!(result, Classification::Warning(m) if m.contains("429")));
        assert!(matches!(
            classify_line("400 Bad Request"),
            Some(Classification::Warning(_))
        ));
    }

    #[test]
    fn test_quiet_logs_are_active() {
        assert_eq!(
            classify_logs(&["Everything is ready. Begin running and processing data."]),
            Classification::Active
        );
        assert_eq!(classify_logs::<&str>(&[]), Classification::Active);
    }

    #[test]
    fn test_structured_error_payload() {
        let line = "2024-05-01T10:00:00Z\terror\texporterhelper/queue.go:101\tExporting failed\t{\"kind\": \"exporter\", \"error\": \"connection refused\"}";
        assert_eq!(
            classify_line(line),
            Some(Classification::Error("error: connection refused".to_string()))
        );
    }

    #[test]
    fn test_short_error_line_is_generic() {
        assert_eq!(
            classify_line("error\tsomething broke"),
            Some(Classification::Error(GENERIC_ERROR.to_string()))
        );
    }

    #[test]
    fn test_bad_payload_fails() {
        let line = "ts\terror\tcaller\tmsg\t{not json";
        let result = classify_logs(&[line]);
        assert!(matches!(result, Classification::Fail(_)));
        assert!(result.status().is_none());
    }

    #[test]
    fn test_latest_line_wins() {
        let lines = ["401 Unauthorized", "all good", "429 Too Many Requests"];
        assert!(matches!(classify_logs(&lines), Classification::Warning(_)));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Classification::Active.status(),
            Some((DeploymentStatus::Active, None))
        );
        let error = Classification::Error("boom".to_string());
        assert_eq!(error.status(), Some((DeploymentStatus::Error, Some("boom"))));
    }
}
