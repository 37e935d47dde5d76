//! Durable transport: Redis Streams with consumer groups.
//!
//! The harvester appends JSON-encoded events under one partition key per
//! source DBMS; the engine reads through a consumer group with per-message
//! acks. The stream is bounded (approximate MAXLEN trimming) - loss under
//! memory pressure is recoverable from the Parquet archive.

use crate::config::StreamConfig;
use crate::models::event::RawEvent;
use crate::utils::error::{PipelineError, PipelineResult};
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimOptions, StreamClaimReply, StreamMaxlen, StreamPendingCountReply,
    StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;

/// One raw message as read from the stream.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub id: String,
    pub payload: String,
}

fn stream_key(config: &StreamConfig, dbms: &str) -> String {
    format!("{}:{}", config.prefix, dbms)
}

fn quarantine_key(config: &StreamConfig, dbms: &str) -> String {
    format!("{}:{}", config.quarantine_prefix, dbms)
}

/// Publisher half, used by the harvester.
pub struct EventStream {
    conn: ConnectionManager,
    key: String,
    maxlen: usize,
}

impl EventStream {
    pub async fn connect(config: &StreamConfig, dbms: &str) -> PipelineResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, key: stream_key(config, dbms), maxlen: config.maxlen })
    }

    /// Append a batch, pipelined, trimming the stream approximately.
    pub async fn publish_batch(&mut self, events: &[RawEvent]) -> PipelineResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for event in events {
            let payload = serde_json::to_string(event)?;
            pipe.xadd_maxlen(
                &self.key,
                StreamMaxlen::Approx(self.maxlen),
                "*",
                &[("data", payload.as_str())],
            );
        }
        pipe.query_async::<_, ()>(&mut self.conn).await?;
        Ok(())
    }

    /// Current stream depth, for backpressure decisions.
    pub async fn depth(&mut self) -> PipelineResult<usize> {
        let len: usize = self.conn.xlen(&self.key).await?;
        Ok(len)
    }
}

/// Consumer-group half, used by the detection engine.
pub struct StreamConsumer {
    conn: ConnectionManager,
    key: String,
    quarantine: String,
    group: String,
    consumer: String,
}

impl StreamConsumer {
    pub async fn connect(
        config: &StreamConfig,
        dbms: &str,
        consumer_name: String,
    ) -> PipelineResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            key: stream_key(config, dbms),
            quarantine: quarantine_key(config, dbms),
            group: config.group.clone(),
            consumer: consumer_name,
        })
    }

    /// Create the consumer group if it does not exist yet.
    pub async fn ensure_group(&mut self) -> PipelineResult<()> {
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.key)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut self.conn)
            .await;
        match result {
            Ok(()) => {
                tracing::info!("Created consumer group {} on {}", self.group, self.key);
                Ok(())
            },
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                tracing::debug!("Consumer group {} already exists on {}", self.group, self.key);
                Ok(())
            },
            Err(e) => Err(PipelineError::Stream(e)),
        }
    }

    /// Blocking read of new messages for this consumer.
    ///
    /// A missing group (`NOGROUP`, e.g. after the stream key was trimmed
    /// away entirely) is repaired in place and reported as an empty batch.
    pub async fn read_batch(
        &mut self,
        count: usize,
        block_ms: u64,
    ) -> PipelineResult<Vec<StreamMessage>> {
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count)
            .block(block_ms as usize);
        let reply: redis::RedisResult<StreamReadReply> = self
            .conn
            .xread_options(&[&self.key], &[">"], &options)
            .await;

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) if e.to_string().contains("NOGROUP") => {
                tracing::warn!("Consumer group missing on {}, recreating", self.key);
                self.ensure_group().await?;
                return Ok(Vec::new());
            },
            Err(e) => return Err(PipelineError::Stream(e)),
        };

        Ok(flatten_reply(reply))
    }

    /// Reclaim messages left pending by dead consumers past the visibility
    /// timeout; they are redelivered to this consumer.
    pub async fn claim_stale(
        &mut self,
        min_idle_ms: u64,
        count: usize,
    ) -> PipelineResult<Vec<StreamMessage>> {
        let pending: StreamPendingCountReply = match self
            .conn
            .xpending_count(&self.key, &self.group, "-", "+", count)
            .await
        {
            Ok(p) => p,
            Err(e) if e.to_string().contains("NOGROUP") => {
                self.ensure_group().await?;
                return Ok(Vec::new());
            },
            Err(e) => return Err(PipelineError::Stream(e)),
        };

        let stale_ids: Vec<String> = pending
            .ids
            .iter()
            .filter(|entry| entry.last_delivered_ms >= min_idle_ms as usize)
            .map(|entry| entry.id.clone())
            .collect();
        if stale_ids.is_empty() {
            return Ok(Vec::new());
        }

        let reply: StreamClaimReply = self
            .conn
            .xclaim_options(
                &self.key,
                &self.group,
                &self.consumer,
                min_idle_ms as usize,
                &stale_ids,
                StreamClaimOptions::default(),
            )
            .await?;

        let mut messages = Vec::with_capacity(reply.ids.len());
        for id in reply.ids {
            if let Some(payload) = extract_data(&id.map) {
                messages.push(StreamMessage { id: id.id, payload });
            }
        }
        Ok(messages)
    }

    pub async fn ack(&mut self, ids: &[String]) -> PipelineResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let _: usize = self.conn.xack(&self.key, &self.group, ids).await?;
        Ok(())
    }

    /// Move messages to the quarantine stream and ack the originals.
    pub async fn quarantine(&mut self, messages: &[StreamMessage]) -> PipelineResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for message in messages {
            pipe.xadd(
                &self.quarantine,
                "*",
                &[
                    ("data", message.payload.as_str()),
                    ("origin_id", message.id.as_str()),
                ],
            );
        }
        pipe.query_async::<_, ()>(&mut self.conn).await?;
        let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
        self.ack(&ids).await?;
        tracing::warn!("Quarantined {} messages to {}", messages.len(), self.quarantine);
        Ok(())
    }

    pub async fn depth(&mut self) -> PipelineResult<usize> {
        let len: usize = self.conn.xlen(&self.key).await?;
        Ok(len)
    }
}

fn flatten_reply(reply: StreamReadReply) -> Vec<StreamMessage> {
    let mut messages = Vec::new();
    for key in reply.keys {
        for id in key.ids {
            if let Some(payload) = extract_data(&id.map) {
                messages.push(StreamMessage { id: id.id, payload });
            } else {
                tracing::warn!("Stream entry {} has no data field, skipping", id.id);
            }
        }
    }
    messages
}

fn extract_data(map: &std::collections::HashMap<String, redis::Value>) -> Option<String> {
    let value = map.get("data")?;
    redis::from_redis_value::<String>(value).ok()
}
