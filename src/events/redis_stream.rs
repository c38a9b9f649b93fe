//! Redis streams backend

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use tracing::{debug, info};

use super::stream::{EventStream, StreamError, StreamMessage};
use super::Fields;

/// Consumer-group streams over a pooled Redis connection
#[derive(Clone)]
pub struct RedisStream {
    pool: Pool,
}

impl RedisStream {
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self, StreamError> {
        let pool = Config::from_url(url)
            .builder()
            .map_err(|e| StreamError::Connection(e.to_string()))?
            .max_size(pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| StreamError::Connection(e.to_string()))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| StreamError::Connection(e.to_string()))?;

        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| StreamError::Connection(e.to_string()))?;

        info!("Connected to event streams");
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, StreamError> {
        self.pool
            .get()
            .await
            .map_err(|e| StreamError::Connection(e.to_string()))
    }
}

fn command_error(e: redis::RedisError) -> StreamError {
    StreamError::Command(e.to_string())
}

fn to_message(entry: StreamId) -> StreamMessage {
    let fields: Fields = entry
        .map
        .iter()
        .filter_map(|(k, v)| {
            redis::from_redis_value::<String>(v)
                .ok()
                .map(|s| (k.clone(), s))
        })
        .collect();
    StreamMessage { id: entry.id, fields }
}

#[async_trait]
impl EventStream for RedisStream {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StreamError> {
        let mut conn = self.conn().await?;
        let result: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "$").await;

        match result {
            Ok(()) => {
                info!("Created consumer group {} on {}", group, stream);
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!("Consumer group {} on {} already exists", group, stream);
                Ok(())
            }
            Err(e) => Err(command_error(e)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, StreamError> {
        let mut conn = self.conn().await?;
        let mut options = StreamReadOptions::default().group(group, consumer).count(count);
        if !block.is_zero() {
            options = options.block(block.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[">"], &options)
            .await
            .map_err(command_error)?;

        Ok(reply
            .map(|r| {
                r.keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(to_message)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError> {
        let mut conn = self.conn().await?;
        let _: i64 = conn.xack(stream, group, &[id]).await.map_err(command_error)?;
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
        let mut conn = self.conn().await?;
        let min_idle_ms = min_idle.as_millis() as usize;

        let pending: StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", count)
            .await
            .map_err(command_error)?;

        let idle_ids: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= min_idle_ms)
            .map(|p| p.id)
            .collect();
        if idle_ids.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle_ms, &idle_ids)
            .await
            .map_err(command_error)?;

        debug!("Claimed {} idle entries on {}", claimed.ids.len(), stream);
        Ok(claimed.ids.into_iter().map(to_message).collect())
    }

    async fn publish(&self, stream: &str, fields: &[(String, String)]) -> Result<String, StreamError> {
        let mut conn = self.conn().await?;
        let id: String = conn.xadd(stream, "*", fields).await.map_err(command_error)?;
        Ok(id)
    }
}
