//! In-memory cluster for tests and dry runs

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::{ClusterApi, ClusterError, ClusterObject, ObjectKind, WorkloadCondition, WorkloadInfo};

/// Cluster double that records applied objects
///
/// Applied workloads report `Available=True` unless conditions were set with
/// [`MemoryCluster::set_conditions`] or new workloads are configured to come
/// up without any.
#[derive(Debug, Default)]
pub struct MemoryCluster {
    objects: DashMap<(ObjectKind, String), Value>,
    workloads: DashMap<String, WorkloadInfo>,
    conditions: DashMap<String, Vec<WorkloadCondition>>,
    logs: DashMap<String, Vec<String>>,
    failing_applies: DashMap<ObjectKind, String>,
    failing_logs: DashMap<String, String>,
    /// Workloads that show up once the listing count reaches the key's value
    delayed: DashMap<String, (usize, WorkloadInfo)>,
    workloads_start_pending: AtomicBool,
    lists: AtomicUsize,
    applies: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applied workloads report no conditions until set explicitly
    pub fn start_workloads_pending(&self) {
        self.workloads_start_pending.store(true, Ordering::SeqCst);
    }

    pub fn set_conditions(&self, name: &str, conditions: Vec<WorkloadCondition>) {
        self.conditions.insert(name.to_string(), conditions);
    }

    pub fn set_logs(&self, name: &str, lines: &[&str]) {
        self.logs
            .insert(name.to_string(), lines.iter().map(|l| l.to_string()).collect());
    }

    pub fn fail_logs(&self, name: &str, reason: &str) {
        self.failing_logs.insert(name.to_string(), reason.to_string());
    }

    /// Make every apply of `kind` fail with `reason`
    pub fn fail_applies(&self, kind: ObjectKind, reason: &str) {
        self.failing_applies.insert(kind, reason.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_applies.clear();
        self.failing_logs.clear();
    }

    /// Register a workload that was not applied through this cluster
    pub fn insert_workload(&self, name: &str, labels: BTreeMap<String, String>) {
        self.workloads
            .insert(name.to_string(), available_workload(name, labels));
    }

    /// Like [`MemoryCluster::insert_workload`], but hidden from the next
    /// `skipped_lists` listings
    pub fn insert_workload_after(&self, skipped_lists: usize, name: &str, labels: BTreeMap<String, String>) {
        let visible_at = self.lists.load(Ordering::SeqCst) + skipped_lists;
        self.delayed
            .insert(name.to_string(), (visible_at, available_workload(name, labels)));
    }

    pub fn object(&self, kind: ObjectKind, name: &str) -> Option<Value> {
        self.objects.get(&(kind, name.to_string())).map(|r| r.clone())
    }

    pub fn has_workload(&self, name: &str) -> bool {
        self.workloads.contains_key(name)
    }

    pub fn workload_count(&self) -> usize {
        self.workloads.len()
    }

    pub fn list_count(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub fn apply_count(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

fn available_workload(name: &str, labels: BTreeMap<String, String>) -> WorkloadInfo {
    WorkloadInfo {
        name: name.to_string(),
        labels,
        conditions: vec![WorkloadCondition::new("Available", "True")],
    }
}

fn labels_of(body: &Value) -> BTreeMap<String, String> {
    body.pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn apply(&self, object: &ClusterObject, _force: bool) -> Result<(), ClusterError> {
        if let Some(reason) = self.failing_applies.get(&object.kind) {
            return Err(ClusterError::Apply(
                format!("{} {}", object.kind, object.name),
                reason.clone(),
            ));
        }

        self.applies.fetch_add(1, Ordering::SeqCst);
        self.objects
            .insert((object.kind, object.name.clone()), object.body.clone());

        if object.kind == ObjectKind::Deployment {
            let conditions = if self.workloads_start_pending.load(Ordering::SeqCst) {
                Vec::new()
            } else {
                vec![WorkloadCondition::new("Available", "True")]
            };
            self.workloads.insert(
                object.name.clone(),
                WorkloadInfo {
                    name: object.name.clone(),
                    labels: labels_of(&object.body),
                    conditions,
                },
            );
        }
        Ok(())
    }

    async fn delete(&self, kind: ObjectKind, name: &str) -> Result<(), ClusterError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.objects.remove(&(kind, name.to_string()));
        if kind == ObjectKind::Deployment {
            self.workloads.remove(name);
        }
        Ok(())
    }

    async fn list_workloads(&self) -> Result<Vec<WorkloadInfo>, ClusterError> {
        let listed = self.lists.fetch_add(1, Ordering::SeqCst);
        self.delayed.retain(|name, (visible_at, info)| {
            if listed < *visible_at {
                return true;
            }
            self.workloads.insert(name.clone(), info.clone());
            false
        });

        let mut workloads: Vec<WorkloadInfo> = self
            .workloads
            .iter()
            .map(|r| {
                let mut info = r.clone();
                if let Some(conditions) = self.conditions.get(&info.name) {
                    info.conditions = conditions.clone();
                }
                info
            })
            .collect();
        workloads.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workloads)
    }

    async fn logs(&self, name: &str, tail: u32, _since: Duration) -> Result<Vec<String>, ClusterError> {
        if let Some(reason) = self.failing_logs.get(name) {
            return Err(ClusterError::Command(reason.clone()));
        }
        let lines = self.logs.get(name).map(|r| r.clone()).unwrap_or_default();
        let skip = lines.len().saturating_sub(tail as usize);
        Ok(lines.into_iter().skip(skip).collect())
    }
}
