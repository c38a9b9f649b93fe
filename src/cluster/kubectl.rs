//! `kubectl`-backed cluster API
//!
//! Argument construction is kept in pure `generate_*_args` functions so it can
//! be tested without a cluster; [`KubectlApi`] only spawns the process.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use super::objects::COLLECTOR_SELECTOR;
use super::{ClusterApi, ClusterError, ClusterObject, ObjectKind, WorkloadCondition, WorkloadInfo};

/// How to reach the cluster
#[derive(Debug, Clone)]
pub struct KubectlConfig {
    /// Path or name of the kubectl binary
    pub binary: String,
    /// kubeconfig context; the current context when unset
    pub context: Option<String>,
    pub namespace: String,
}

impl Default for KubectlConfig {
    fn default() -> Self {
        Self {
            binary: "kubectl".to_string(),
            context: None,
            namespace: "otelcollectors".to_string(),
        }
    }
}

fn base_args(config: &KubectlConfig) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(ref context) = config.context {
        args.push("--context".to_string());
        args.push(context.clone());
    }
    args.push("--namespace".to_string());
    args.push(config.namespace.clone());
    args
}

/// Arguments for `kubectl apply` reading the object from stdin
pub fn generate_apply_args(config: &KubectlConfig, force: bool) -> Vec<String> {
    let mut args = base_args(config);
    args.extend(["apply", "-f", "-"].map(String::from));
    if force {
        args.push("--force".to_string());
    }
    args
}

pub fn generate_delete_args(config: &KubectlConfig, kind: ObjectKind, name: &str) -> Vec<String> {
    let mut args = base_args(config);
    args.push("delete".to_string());
    args.push(kind.resource().to_string());
    args.push(name.to_string());
    args.push("--ignore-not-found".to_string());
    args
}

pub fn generate_list_args(config: &KubectlConfig) -> Vec<String> {
    let mut args = base_args(config);
    args.extend(["get", "deployments", "-l", COLLECTOR_SELECTOR, "-o", "json"].map(String::from));
    args
}

pub fn generate_logs_args(config: &KubectlConfig, name: &str, tail: u32, since: Duration) -> Vec<String> {
    let mut args = base_args(config);
    args.push("logs".to_string());
    args.push(format!("deployment/{}", name));
    args.push(format!("--tail={}", tail));
    args.push(format!("--since={}s", since.as_secs().max(1)));
    args
}

/// Parse `kubectl get deployments -o json` output
pub fn parse_workload_list(raw: &str) -> Result<Vec<WorkloadInfo>, ClusterError> {
    let doc: Value = serde_json::from_str(raw).map_err(|e| ClusterError::Parse(e.to_string()))?;
    let items = doc
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| ClusterError::Parse("missing 'items' array".to_string()))?;

    items.iter().map(parse_workload).collect()
}

fn parse_workload(item: &Value) -> Result<WorkloadInfo, ClusterError> {
    let metadata = item
        .get("metadata")
        .ok_or_else(|| ClusterError::Parse("workload without metadata".to_string()))?;
    let name = metadata
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ClusterError::Parse("workload without name".to_string()))?
        .to_string();

    let labels: BTreeMap<String, String> = metadata
        .get("labels")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let status = item.get("status");
    let conditions: Vec<WorkloadCondition> = match status.and_then(|s| s.get("conditions")) {
        Some(raw) => serde_json::from_value(raw.clone())
            .map_err(|e| ClusterError::Parse(format!("conditions of {}: {}", name, e)))?,
        None => Vec::new(),
    };

    Ok(WorkloadInfo {
        name,
        labels,
        conditions,
    })
}

/// Cluster API that shells out to kubectl
#[derive(Debug, Clone, Default)]
pub struct KubectlApi {
    config: KubectlConfig,
}

impl KubectlApi {
    pub fn new(config: KubectlConfig) -> Self {
        Self { config }
    }

    async fn run(&self, args: &[String], stdin: Option<Vec<u8>>) -> Result<String, ClusterError> {
        trace!("{} {:?}", self.config.binary, args);

        let mut command = Command::new(&self.config.binary);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });

        let mut child = command.spawn()?;
        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(&input).await?;
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClusterError::Command(format!(
                "{} exited with {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ClusterApi for KubectlApi {
    async fn apply(&self, object: &ClusterObject, force: bool) -> Result<(), ClusterError> {
        let body = serde_json::to_vec(&object.body)
            .map_err(|e| ClusterError::Apply(format!("{} {}", object.kind, object.name), e.to_string()))?;

        self.run(&generate_apply_args(&self.config, force), Some(body))
            .await
            .map_err(|e| ClusterError::Apply(format!("{} {}", object.kind, object.name), e.to_string()))?;

        debug!("Applied {} {}", object.kind, object.name);
        Ok(())
    }

    async fn delete(&self, kind: ObjectKind, name: &str) -> Result<(), ClusterError> {
        self.run(&generate_delete_args(&self.config, kind, name), None).await?;
        debug!("Deleted {} {}", kind, name);
        Ok(())
    }

    async fn list_workloads(&self) -> Result<Vec<WorkloadInfo>, ClusterError> {
        let raw = self.run(&generate_list_args(&self.config), None).await?;
        parse_workload_list(&raw)
    }

    async fn logs(&self, name: &str, tail: u32, since: Duration) -> Result<Vec<String>, ClusterError> {
        let raw = self
            .run(&generate_logs_args(&self.config, name, tail, since), None)
            .await?;
        Ok(raw.lines().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> KubectlConfig {
        KubectlConfig {
            namespace: "collectors".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_generate_apply_args() {
        let args = generate_apply_args(&config(), false);
        assert_eq!(args, vec!["--namespace", "collectors", "apply", "-f", "-"]);

        let forced = generate_apply_args(&config(), true);
        assert_eq!(forced.last().map(String::as_str), Some("--force"));
    }

    #[test]
    fn test_context_is_passed() {
        let cfg = KubectlConfig {
            context: Some("prod".to_string()),
            ..config()
        };
        let args = generate_delete_args(&cfg, ObjectKind::Deployment, "otel-s1");
        assert_eq!(
            args,
            vec![
                "--context",
                "prod",
                "--namespace",
                "collectors",
                "delete",
                "deployment",
                "otel-s1",
                "--ignore-not-found"
            ]
        );
    }

    #[test]
    fn test_generate_list_args() {
        let args = generate_list_args(&config());
        assert!(args.contains(&"app=opentelemetry,component=otel-collector".to_string()));
        assert_eq!(&args[args.len() - 2..], &["-o", "json"]);
    }

    #[test]
    fn test_generate_logs_args() {
        let args = generate_logs_args(&config(), "otel-s1", 10, Duration::from_secs(300));
        assert_eq!(&args[2..], &["logs", "deployment/otel-s1", "--tail=10", "--since=300s"]);
    }

    #[test]
    fn test_parse_workload_list() {
        let raw = r#"{
            "items": [
                {
                    "metadata": {"name": "otel-s1", "labels": {"sink-id": "s1", "owner-id": "o1"}},
                    "status": {
                        "readyReplicas": 1,
                        "conditions": [
                            {"type": "Available", "status": "True", "reason": "MinimumReplicasAvailable"}
                        ]
                    }
                },
                {
                    "metadata": {"name": "otel-s2"},
                    "status": {}
                }
            ]
        }"#;

        let workloads = parse_workload_list(raw).unwrap();
        assert_eq!(workloads.len(), 2);
        assert_eq!(workloads[0].name, "otel-s1");
        assert_eq!(workloads[0].labels["sink-id"], "s1");
        assert_eq!(workloads[0].conditions[0].condition_type, "Available");
        assert!(workloads[1].conditions.is_empty());
    }

    #[test]
    fn test_parse_workload_list_rejects_garbage() {
        assert!(matches!(parse_workload_list("not json"), Err(ClusterError::Parse(_))));
        assert!(matches!(parse_workload_list("{}"), Err(ClusterError::Parse(_))));
    }
}
