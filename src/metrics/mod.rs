//! Service metrics
//!
//! Per-operation call, failure and latency counters for the deployment
//! service, plus cumulative monitor tick statistics. Counters are atomics so
//! the consumers, the monitor and the HTTP surface can share one instance
//! without locking.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Counters for one service operation
#[derive(Debug, Default)]
struct OperationCounters {
    calls: AtomicU64,
    failures: AtomicU64,
    in_flight: AtomicU32,
    total_latency_ms: AtomicU64,
}

/// Point-in-time view of one operation's counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationSnapshot {
    pub calls: u64,
    pub failures: u64,
    pub in_flight: u32,
    pub avg_latency_ms: f64,
}

/// Cumulative monitor counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorSnapshot {
    pub ticks: u64,
    pub inspected: u64,
    pub orphans_removed: u64,
    pub status_updates: u64,
    pub skipped: u64,
    pub failures: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}

/// Everything `/metrics` reports
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub operations: std::collections::BTreeMap<String, OperationSnapshot>,
    pub monitor: MonitorSnapshot,
    pub collected_at: DateTime<Utc>,
}

/// Shared metrics registry
#[derive(Debug, Default)]
pub struct ServiceMetrics {
    operations: DashMap<&'static str, OperationCounters>,
    monitor_ticks: AtomicU64,
    monitor_inspected: AtomicU64,
    monitor_orphans: AtomicU64,
    monitor_updates: AtomicU64,
    monitor_skipped: AtomicU64,
    monitor_failures: AtomicU64,
    last_tick_at: RwLock<Option<DateTime<Utc>>>,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of an operation
    pub fn record_start(&self, operation: &'static str) {
        self.operations
            .entry(operation)
            .or_default()
            .in_flight
            .fetch_add(1, Ordering::SeqCst);
    }

    /// Record the end of an operation with its latency and outcome
    pub fn record_end(&self, operation: &'static str, latency: Duration, success: bool) {
        let counters = self.operations.entry(operation).or_default();
        counters.calls.fetch_add(1, Ordering::SeqCst);
        counters
            .total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::SeqCst);
        if !success {
            counters.failures.fetch_add(1, Ordering::SeqCst);
        }
        let _ = counters
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    /// Fold one monitor tick into the cumulative counters
    pub fn record_tick(&self, inspected: u64, orphans_removed: u64, status_updates: u64, skipped: u64, failures: u64) {
        self.monitor_ticks.fetch_add(1, Ordering::SeqCst);
        self.monitor_inspected.fetch_add(inspected, Ordering::SeqCst);
        self.monitor_orphans.fetch_add(orphans_removed, Ordering::SeqCst);
        self.monitor_updates.fetch_add(status_updates, Ordering::SeqCst);
        self.monitor_skipped.fetch_add(skipped, Ordering::SeqCst);
        self.monitor_failures.fetch_add(failures, Ordering::SeqCst);
        if let Ok(mut last) = self.last_tick_at.write() {
            *last = Some(Utc::now());
        }
    }

    pub fn operation(&self, operation: &str) -> Option<OperationSnapshot> {
        self.operations.get(operation).map(|c| snapshot_of(&c))
    }

    pub fn monitor(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            ticks: self.monitor_ticks.load(Ordering::SeqCst),
            inspected: self.monitor_inspected.load(Ordering::SeqCst),
            orphans_removed: self.monitor_orphans.load(Ordering::SeqCst),
            status_updates: self.monitor_updates.load(Ordering::SeqCst),
            skipped: self.monitor_skipped.load(Ordering::SeqCst),
            failures: self.monitor_failures.load(Ordering::SeqCst),
            last_tick_at: self.last_tick_at.read().ok().and_then(|t| *t),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations: self
                .operations
                .iter()
                .map(|r| (r.key().to_string(), snapshot_of(r.value())))
                .collect(),
            monitor: self.monitor(),
            collected_at: Utc::now(),
        }
    }
}

fn snapshot_of(counters: &OperationCounters) -> OperationSnapshot {
    let calls = counters.calls.load(Ordering::SeqCst);
    let total = counters.total_latency_ms.load(Ordering::SeqCst);
    OperationSnapshot {
        calls,
        failures: counters.failures.load(Ordering::SeqCst),
        in_flight: counters.in_flight.load(Ordering::SeqCst),
        avg_latency_ms: if calls > 0 { total as f64 / calls as f64 } else { 0.0 },
    }
}
