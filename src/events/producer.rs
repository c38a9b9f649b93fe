//! Status producer - publishes deployment status changes

use std::sync::Arc;

use tracing::debug;

use super::stream::{EventStream, StreamError};
use super::StatusChangeEvent;

/// Publishes [`StatusChangeEvent`]s onto the outbound status stream
#[derive(Clone)]
pub struct StatusProducer {
    stream: Arc<dyn EventStream>,
    stream_name: String,
}

impl StatusProducer {
    pub fn new(stream: Arc<dyn EventStream>, stream_name: impl Into<String>) -> Self {
        Self {
            stream,
            stream_name: stream_name.into(),
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub async fn publish(&self, event: &StatusChangeEvent) -> Result<String, StreamError> {
        let id = self.stream.publish(&self.stream_name, &event.to_fields()).await?;
        debug!(
            "Published status '{}' for {}/{} as {}",
            event.status, event.owner_id, event.sink_id, id
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryStream;

    #[tokio::test]
    async fn test_publish_status_change() {
        let stream = Arc::new(MemoryStream::new());
        let producer = StatusProducer::new(stream.clone(), "sinks.status");

        producer
            .publish(&StatusChangeEvent::new("o1", "s1", "active", None))
            .await
            .unwrap();

        let entries = stream.entries("sinks.status").await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["owner_id"], "o1");
        assert_eq!(entries[0]["status"], "active");
        assert_eq!(entries[0]["error_message"], "");
    }
}
