//! Durable stream transport: append-only per-type logs with grouped,
//! acknowledged consumption.

pub mod memory;
pub mod redis;

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::TransportError;
use crate::tasks::model::DeliveryMessage;

pub use memory::MemoryTransport;
pub use self::redis::RedisTransport;

/// One message claimed by a consumer and not yet acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Stream the entry was read from, e.g. `tasks:hex`.
    pub stream: String,
    /// Transport-assigned entry id, used for acknowledgment.
    pub entry_id: String,
    /// Decoded message, or the reason it could not be decoded.
    pub message: Result<DeliveryMessage, String>,
}

/// Grouped stream transport.
///
/// Within a group, each entry is handed to at most one consumer at a time
/// and stays pending until acknowledged.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Create `group` on `stream` if missing, creating the stream as needed.
    /// Existing groups are left untouched.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), TransportError>;

    /// Append a message. Returns the entry id.
    async fn append(
        &self,
        stream: &str,
        message: &DeliveryMessage,
    ) -> Result<String, TransportError>;

    /// Hand out one never-delivered entry across `streams`, waiting up to
    /// `block` for one to arrive.
    ///
    /// A single read may claim one entry per stream. Entries claimed beyond
    /// the one returned are held for this consumer and returned by later
    /// calls before the transport is read again.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        block: Duration,
    ) -> Result<Option<Delivery>, TransportError>;

    /// Acknowledge an entry, removing it from the group's pending list.
    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), TransportError>;

    /// Take over one entry that another consumer claimed at least `min_idle`
    /// ago without acknowledging it.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Option<Delivery>, TransportError>;

    /// Release connections.
    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Entries claimed by a read but not yet handed to the caller, per
/// `(group, consumer)`. They are already pending on the server side.
#[derive(Default)]
pub(crate) struct ClaimBuffer {
    held: Mutex<HashMap<(String, String), VecDeque<Delivery>>>,
}

impl ClaimBuffer {
    /// Pop the oldest held entry belonging to one of `streams`.
    pub(crate) async fn take(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
    ) -> Option<Delivery> {
        let mut held = self.held.lock().await;
        let key = (group.to_string(), consumer.to_string());
        let queue = held.get_mut(&key)?;
        let position = queue.iter().position(|d| streams.contains(&d.stream))?;
        let delivery = queue.remove(position);
        if queue.is_empty() {
            held.remove(&key);
        }
        delivery
    }

    /// Return the first of `claimed` and hold the rest.
    pub(crate) async fn hand_out(
        &self,
        group: &str,
        consumer: &str,
        claimed: Vec<Delivery>,
    ) -> Option<Delivery> {
        let mut claimed = claimed.into_iter();
        let first = claimed.next()?;
        let rest: VecDeque<Delivery> = claimed.collect();
        if !rest.is_empty() {
            self.held
                .lock()
                .await
                .entry((group.to_string(), consumer.to_string()))
                .or_default()
                .extend(rest);
        }
        Some(first)
    }

    #[cfg(test)]
    pub(crate) async fn held(&self, group: &str, consumer: &str) -> usize {
        self.held
            .lock()
            .await
            .get(&(group.to_string(), consumer.to_string()))
            .map_or(0, VecDeque::len)
    }
}
