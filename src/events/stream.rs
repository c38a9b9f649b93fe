//! Consumer-group stream seam
//!
//! Semantics follow Redis streams: a group tracks the last delivered entry,
//! delivered entries stay pending for the consumer until acknowledged, and
//! pending entries idle for long enough can be claimed for redelivery.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};

use super::Fields;

/// Errors from the stream backend
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Stream connection error: {0}")]
    Connection(String),

    #[error("Stream command failed: {0}")]
    Command(String),

    #[error("Consumer group '{1}' does not exist on stream '{0}'")]
    NoGroup(String, String),
}

/// One entry read from a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: String,
    pub fields: Fields,
}

#[async_trait]
pub trait EventStream: Send + Sync {
    /// Create the consumer group (and stream) if missing
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StreamError>;

    /// Read entries never delivered to this group, waiting up to `block`
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, StreamError>;

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError>;

    /// Take over pending entries idle for at least `min_idle`
    async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StreamError>;

    /// Append an entry, returning its id
    async fn publish(&self, stream: &str, fields: &[(String, String)]) -> Result<String, StreamError>;
}

// ============================================================================
// In-memory stream
// ============================================================================

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index into the stream's entries of the next undelivered entry
    next: usize,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<(u64, Fields)>,
    groups: HashMap<String, GroupState>,
}

fn format_id(seq: u64) -> String {
    format!("{}-0", seq)
}

fn parse_id(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

/// In-process stream with consumer-group semantics
#[derive(Debug, Default)]
pub struct MemoryStream {
    streams: Mutex<HashMap<String, StreamState>>,
    seq: std::sync::atomic::AtomicU64,
    notify: Notify,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry ever published to `stream`
    pub async fn entries(&self, stream: &str) -> Vec<Fields> {
        let streams = self.streams.lock().await;
        streams
            .get(stream)
            .map(|s| s.entries.iter().map(|(_, f)| f.clone()).collect())
            .unwrap_or_default()
    }

    /// Entries delivered to `group` but not yet acknowledged
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        let streams = self.streams.lock().await;
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// How often the pending entry `id` has been delivered
    pub async fn delivery_count(&self, stream: &str, group: &str, id: &str) -> u32 {
        let streams = self.streams.lock().await;
        parse_id(id)
            .and_then(|seq| streams.get(stream)?.groups.get(group)?.pending.get(&seq))
            .map(|p| p.deliveries)
            .unwrap_or(0)
    }

    /// Consumer currently owning the pending entry `id`
    pub async fn pending_consumer(&self, stream: &str, group: &str, id: &str) -> Option<String> {
        let streams = self.streams.lock().await;
        parse_id(id)
            .and_then(|seq| streams.get(stream)?.groups.get(group)?.pending.get(&seq))
            .map(|p| p.consumer.clone())
    }

    async fn take_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StreamError> {
        let mut streams = self.streams.lock().await;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| StreamError::NoGroup(stream.to_string(), group.to_string()))?;
        let StreamState { entries, groups } = state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| StreamError::NoGroup(stream.to_string(), group.to_string()))?;

        let end = entries.len().min(group_state.next + count);
        let now = Instant::now();
        let mut messages = Vec::new();
        for (seq, fields) in &entries[group_state.next..end] {
            group_state.pending.insert(
                *seq,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            messages.push(StreamMessage {
                id: format_id(*seq),
                fields: fields.clone(),
            });
        }
        group_state.next = end;
        Ok(messages)
    }
}

#[async_trait]
impl EventStream for MemoryStream {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StreamError> {
        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.to_string()).or_default();
        // a new group starts at the end of the stream, like `XGROUP CREATE ... $`
        let next = state.entries.len();
        state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState { next, ..Default::default() });
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, StreamError> {
        let notified = self.notify.notified();
        let messages = self.take_new(stream, group, consumer, count).await?;
        if !messages.is_empty() || block.is_zero() {
            return Ok(messages);
        }

        let _ = tokio::time::timeout(block, notified).await;
        self.take_new(stream, group, consumer, count).await
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError> {
        let mut streams = self.streams.lock().await;
        if let (Some(seq), Some(group_state)) = (
            parse_id(id),
            streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)),
        ) {
            group_state.pending.remove(&seq);
        }
        Ok(())
    }

    async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StreamError> {
        let mut streams = self.streams.lock().await;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| StreamError::NoGroup(stream.to_string(), group.to_string()))?;
        let StreamState { entries, groups } = state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| StreamError::NoGroup(stream.to_string(), group.to_string()))?;

        let now = Instant::now();
        let mut messages = Vec::new();
        for (seq, pending) in group_state.pending.iter_mut() {
            if messages.len() >= count {
                break;
            }
            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            let Some((_, fields)) = entries.iter().find(|(s, _)| s == seq) else {
                continue;
            };
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.deliveries += 1;
            messages.push(StreamMessage {
                id: format_id(*seq),
                fields: fields.clone(),
            });
        }
        Ok(messages)
    }

    async fn publish(&self, stream: &str, fields: &[(String, String)]) -> Result<String, StreamError> {
        let seq = self.seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        {
            let mut streams = self.streams.lock().await;
            let state = streams.entry(stream.to_string()).or_default();
            state.entries.push((seq, fields.iter().cloned().collect()));
        }
        self.notify.notify_waiters();
        Ok(format_id(seq))
    }
}
