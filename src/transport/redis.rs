//! Redis Streams transport.
//!
//! One stream per task type, consumer groups created with `MKSTREAM` from id
//! `0`. Blocking `XREADGROUP` calls run on their own connection with no
//! response timeout so they never stall appends or acks on the shared one.
//! `COUNT 1` applies per stream, so one read can claim an entry from every
//! stream with work; the extras are held and handed out by later reads.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, AsyncConnectionConfig};
use tracing::debug;

use crate::error::TransportError;
use crate::tasks::model::DeliveryMessage;
use crate::transport::{ClaimBuffer, Delivery, StreamTransport};

/// Stream transport backed by Redis Streams.
pub struct RedisTransport {
    conn: MultiplexedConnection,
    reader: MultiplexedConnection,
    claimed: ClaimBuffer,
}

impl RedisTransport {
    /// Connect to Redis at `url`, opening the shared and blocking-read connections.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(url).map_err(|e| {
            TransportError::Connection(format!("Failed to create Redis client: {e}"))
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to connect to Redis: {e}")))?;
        let reader_config = AsyncConnectionConfig::new().set_response_timeout(None);
        let reader = client
            .get_multiplexed_async_connection_with_config(&reader_config)
            .await
            .map_err(|e| {
                TransportError::Connection(format!("Failed to open Redis reader connection: {e}"))
            })?;
        debug!("Redis stream transport connected");
        Ok(Self {
            conn,
            reader,
            claimed: ClaimBuffer::default(),
        })
    }
}

fn command_error(command: &'static str, stream: &str, err: redis::RedisError) -> TransportError {
    TransportError::Command {
        command,
        stream: stream.to_string(),
        reason: err.to_string(),
    }
}

fn to_delivery(stream: &str, entry: &StreamId) -> Delivery {
    let fields: HashMap<String, String> = entry
        .map
        .keys()
        .filter_map(|key| entry.get::<String>(key).map(|value| (key.clone(), value)))
        .collect();
    Delivery {
        stream: stream.to_string(),
        entry_id: entry.id.clone(),
        message: DeliveryMessage::from_fields(stream, &entry.id, &fields)
            .map_err(|e| e.to_string()),
    }
}

#[async_trait]
impl StreamTransport for RedisTransport {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), TransportError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(stream, group, "0").await;
        match created {
            Ok(()) => {
                debug!(stream, group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(command_error("XGROUP CREATE", stream, e)),
        }
    }

    async fn append(
        &self,
        stream: &str,
        message: &DeliveryMessage,
    ) -> Result<String, TransportError> {
        let fields = message.to_fields().map_err(|e| TransportError::Command {
            command: "XADD",
            stream: stream.to_string(),
            reason: e.to_string(),
        })?;
        let mut conn = self.conn.clone();
        let id: Option<String> = conn
            .xadd(stream, "*", fields.as_slice())
            .await
            .map_err(|e| command_error("XADD", stream, e))?;
        id.ok_or_else(|| TransportError::Command {
            command: "XADD",
            stream: stream.to_string(),
            reason: "server returned no entry id".into(),
        })
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        block: Duration,
    ) -> Result<Option<Delivery>, TransportError> {
        if let Some(held) = self.claimed.take(group, consumer, streams).await {
            return Ok(Some(held));
        }

        let mut options = StreamReadOptions::default().group(group, consumer).count(1);
        // BLOCK 0 means forever in Redis.
        if !block.is_zero() {
            options = options.block(block.as_millis() as usize);
        }
        let ids = vec![">"; streams.len()];
        let stream_label = streams.join(",");

        let mut reader = self.reader.clone();
        let reply: Option<StreamReadReply> = reader
            .xread_options(streams, ids.as_slice(), &options)
            .await
            .map_err(|e| command_error("XREADGROUP", &stream_label, e))?;

        let claimed: Vec<Delivery> = reply
            .map(|reply| {
                reply
                    .keys
                    .iter()
                    .flat_map(|key| key.ids.iter().map(|entry| to_delivery(&key.key, entry)))
                    .collect()
            })
            .unwrap_or_default();
        if claimed.len() > 1 {
            debug!(count = claimed.len(), "Holding extra claimed entries");
        }
        Ok(self.claimed.hand_out(group, consumer, claimed).await)
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), TransportError> {
        let mut conn = self.conn.clone();
        let _acked: usize = conn
            .xack(stream, group, &[entry_id])
            .await
            .map_err(|e| command_error("XACK", stream, e))?;
        Ok(())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Option<Delivery>, TransportError> {
        let mut conn = self.conn.clone();
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                stream,
                group,
                consumer,
                min_idle.as_millis() as u64,
                "0-0",
                StreamAutoClaimOptions::default().count(1),
            )
            .await
            .map_err(|e| command_error("XAUTOCLAIM", stream, e))?;
        Ok(reply
            .claimed
            .first()
            .map(|entry| to_delivery(stream, entry)))
    }
}
