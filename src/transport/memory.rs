//! In-process stream transport with consumer-group semantics.
//!
//! Mirrors the subset of Redis Streams the consumer relies on: groups start
//! at the beginning of the stream, each entry is claimed by one consumer,
//! claimed entries stay pending until acknowledged, and idle pending entries
//! can be reclaimed. A read claims at most one entry per stream, like
//! `XREADGROUP COUNT 1`. Entries every group has consumed and acknowledged
//! are dropped. Recent `ack` calls are logged so tests can count them.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::TransportError;
use crate::tasks::model::DeliveryMessage;
use crate::transport::{ClaimBuffer, Delivery, StreamTransport};

/// Most recent `ack` calls kept in the log.
const ACK_LOG_LIMIT: usize = 1024;

struct Entry {
    seq: u64,
    fields: HashMap<String, String>,
}

impl Entry {
    fn id(&self) -> String {
        format!("{}-0", self.seq)
    }
}

struct PendingEntry {
    seq: u64,
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

struct Group {
    /// Sequence number of the next never-delivered entry.
    next_seq: u64,
    pending: HashMap<String, PendingEntry>,
}

impl Default for Group {
    fn default() -> Self {
        Self {
            next_seq: 1,
            pending: HashMap::new(),
        }
    }
}

impl Group {
    /// Lowest sequence number this group still needs.
    fn floor(&self) -> u64 {
        self.pending
            .values()
            .map(|p| p.seq)
            .min()
            .map_or(self.next_seq, |seq| seq.min(self.next_seq))
    }
}

#[derive(Default)]
struct Stream {
    /// Retained entries in sequence order.
    entries: VecDeque<Entry>,
    last_seq: u64,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn entry(&self, seq: u64) -> Option<&Entry> {
        let first = self.entries.front()?.seq;
        let index = usize::try_from(seq.checked_sub(first)?).ok()?;
        self.entries.get(index)
    }

    /// Drop entries every group has read and acknowledged. Streams without
    /// groups keep everything so a group created later still sees it.
    fn compact(&mut self) {
        let Some(floor) = self.groups.values().map(Group::floor).min() else {
            return;
        };
        while self.entries.front().is_some_and(|e| e.seq < floor) {
            self.entries.pop_front();
        }
    }
}

/// One recorded `ack` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    pub stream: String,
    pub group: String,
    pub entry_id: String,
    /// Whether the entry was still pending when acknowledged.
    pub removed: bool,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, Stream>,
    acks: VecDeque<AckRecord>,
}

/// Stream transport held in process memory.
pub struct MemoryTransport {
    state: Mutex<State>,
    claimed: ClaimBuffer,
    notify: Notify,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            claimed: ClaimBuffer::default(),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Number of entries ever appended to `stream`.
    pub async fn stream_len(&self, stream: &str) -> usize {
        let state = self.state.lock().await;
        state
            .streams
            .get(stream)
            .map_or(0, |s| usize::try_from(s.last_seq).unwrap_or(usize::MAX))
    }

    /// Number of entries of `stream` still held in memory.
    pub async fn retained(&self, stream: &str) -> usize {
        let state = self.state.lock().await;
        state.streams.get(stream).map_or(0, |s| s.entries.len())
    }

    /// Entries claimed by `group` on `stream` and not yet acknowledged.
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        let state = self.state.lock().await;
        state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// The most recent `ack` calls, oldest first.
    pub async fn acks(&self) -> Vec<AckRecord> {
        self.state.lock().await.acks.iter().cloned().collect()
    }

    /// How many logged `ack` calls named `entry_id` on `stream`.
    pub async fn ack_count(&self, stream: &str, entry_id: &str) -> usize {
        let state = self.state.lock().await;
        state
            .acks
            .iter()
            .filter(|a| a.stream == stream && a.entry_id == entry_id)
            .count()
    }

    /// Claim the next never-delivered entry of each stream in `streams`.
    fn claim_each(
        state: &mut State,
        group: &str,
        consumer: &str,
        streams: &[String],
    ) -> Result<Vec<Delivery>, TransportError> {
        let mut claimed = Vec::new();
        for name in streams {
            let stream = state
                .streams
                .get_mut(name)
                .ok_or_else(|| no_group(name, group))?;
            let next_seq = stream
                .groups
                .get(group)
                .ok_or_else(|| no_group(name, group))?
                .next_seq;

            let Some(entry) = stream.entry(next_seq) else {
                continue;
            };
            let delivery = to_delivery(name, entry);
            if let Some(group_state) = stream.groups.get_mut(group) {
                group_state.next_seq = next_seq + 1;
                group_state.pending.insert(
                    delivery.entry_id.clone(),
                    PendingEntry {
                        seq: next_seq,
                        consumer: consumer.to_string(),
                        delivered_at: Instant::now(),
                        delivery_count: 1,
                    },
                );
            }
            claimed.push(delivery);
        }
        Ok(claimed)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn no_group(stream: &str, group: &str) -> TransportError {
    TransportError::Command {
        command: "XREADGROUP",
        stream: stream.to_string(),
        reason: format!("NOGROUP no such consumer group '{group}'"),
    }
}

fn to_delivery(stream: &str, entry: &Entry) -> Delivery {
    let entry_id = entry.id();
    Delivery {
        stream: stream.to_string(),
        message: DeliveryMessage::from_fields(stream, &entry_id, &entry.fields)
            .map_err(|e| e.to_string()),
        entry_id,
    }
}

#[async_trait]
impl StreamTransport for MemoryTransport {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), TransportError> {
        self.check_open()?;
        let mut state = self.state.lock().await;
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn append(
        &self,
        stream: &str,
        message: &DeliveryMessage,
    ) -> Result<String, TransportError> {
        self.check_open()?;
        let fields = message
            .to_fields()
            .map_err(|e| TransportError::Command {
                command: "XADD",
                stream: stream.to_string(),
                reason: e.to_string(),
            })?
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        let id = {
            let mut state = self.state.lock().await;
            let stream_state = state.streams.entry(stream.to_string()).or_default();
            stream_state.last_seq += 1;
            let entry = Entry {
                seq: stream_state.last_seq,
                fields,
            };
            let id = entry.id();
            stream_state.entries.push_back(entry);
            id
        };
        self.notify.notify_waiters();
        Ok(id)
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

        let deadline = Instant::now() + block;
        loop {
            self.check_open()?;
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let claimed = {
                let mut state = self.state.lock().await;
                Self::claim_each(&mut state, group, consumer, streams)?
            };
            if !claimed.is_empty() {
                return Ok(self.claimed.hand_out(group, consumer, claimed).await);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), TransportError> {
        self.check_open()?;
        let mut state = self.state.lock().await;
        let mut removed = false;
        if let Some(stream_state) = state.streams.get_mut(stream) {
            removed = stream_state
                .groups
                .get_mut(group)
                .is_some_and(|g| g.pending.remove(entry_id).is_some());
            if removed {
                stream_state.compact();
            }
        }
        if state.acks.len() == ACK_LOG_LIMIT {
            state.acks.pop_front();
        }
        state.acks.push_back(AckRecord {
            stream: stream.to_string(),
            group: group.to_string(),
            entry_id: entry_id.to_string(),
            removed,
        });
        Ok(())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Option<Delivery>, TransportError> {
        self.check_open()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Ok(None);
        };
        let Some(group_state) = stream_state.groups.get_mut(group) else {
            return Err(no_group(stream, group));
        };

        let Some(pending) = group_state
            .pending
            .values_mut()
            .filter(|p| now.duration_since(p.delivered_at) >= min_idle)
            .min_by_key(|p| p.delivered_at)
        else {
            return Ok(None);
        };
        pending.consumer = consumer.to_string();
        pending.delivered_at = now;
        pending.delivery_count += 1;
        let seq = pending.seq;

        Ok(stream_state
            .entry(seq)
            .map(|entry| to_delivery(stream, entry)))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const STREAM: &str = "tasks:hex";
    const GROUP: &str = "ai-workers";

    fn streams() -> Vec<String> {
        vec![STREAM.to_string()]
    }

    #[tokio::test]
    async fn read_requires_group() {
        let transport = MemoryTransport::new();
        transport
            .append(STREAM, &DeliveryMessage::new("t1", json!({})))
            .await
            .unwrap();
        let err = transport
            .read_group(GROUP, "w1", &streams(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("NOGROUP"));
    }

    #[tokio::test]
    async fn group_sees_entries_appended_before_creation() {
        let transport = MemoryTransport::new();
        transport
            .append(STREAM, &DeliveryMessage::new("t1", json!({"a": 1})))
            .await
            .unwrap();
        transport.ensure_group(STREAM, GROUP).await.unwrap();
        transport.ensure_group(STREAM, GROUP).await.unwrap();

        let delivery = transport
            .read_group(GROUP, "w1", &streams(), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let message = delivery.message.unwrap();
        assert_eq!(message.task_id, "t1");
        assert_eq!(message.payload, json!({"a": 1}));
    }

    #[tokio::test]
    async fn each_entry_goes_to_one_consumer() {
        let transport = MemoryTransport::new();
        transport.ensure_group(STREAM, GROUP).await.unwrap();
        transport
            .append(STREAM, &DeliveryMessage::new("t1", json!({})))
            .await
            .unwrap();

        let first = transport
            .read_group(GROUP, "w1", &streams(), Duration::ZERO)
            .await
            .unwrap();
        let second = transport
            .read_group(GROUP, "w2", &streams(), Duration::ZERO)
            .await
            .unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(transport.pending_count(STREAM, GROUP).await, 1);
    }

    #[tokio::test]
    async fn ack_clears_pending_and_is_logged() {
        let transport = MemoryTransport::new();
        transport.ensure_group(STREAM, GROUP).await.unwrap();
        let id = transport
            .append(STREAM, &DeliveryMessage::new("t1", json!({})))
            .await
            .unwrap();
        transport
            .read_group(GROUP, "w1", &streams(), Duration::ZERO)
            .await
            .unwrap();

        transport.ack(STREAM, GROUP, &id).await.unwrap();
        transport.ack(STREAM, GROUP, &id).await.unwrap();

        assert_eq!(transport.pending_count(STREAM, GROUP).await, 0);
        let acks = transport.acks().await;
        assert_eq!(acks.len(), 2);
        assert!(acks[0].removed);
        assert!(!acks[1].removed);
    }

    #[tokio::test]
    async fn one_read_claims_per_stream_and_hands_out_in_turn() {
        let transport = MemoryTransport::new();
        let both = vec![STREAM.to_string(), "tasks:job".to_string()];
        for name in &both {
            transport.ensure_group(name, GROUP).await.unwrap();
            transport
                .append(name, &DeliveryMessage::new(name, json!({})))
                .await
                .unwrap();
        }

        let first = transport
            .read_group(GROUP, "w1", &both, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.stream, STREAM);
        assert_eq!(transport.pending_count(STREAM, GROUP).await, 1);
        assert_eq!(transport.pending_count("tasks:job", GROUP).await, 1);

        let other = transport
            .read_group(GROUP, "w2", &both, Duration::ZERO)
            .await
            .unwrap();
        assert!(other.is_none());

        let second = transport
            .read_group(GROUP, "w1", &both, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.stream, "tasks:job");
        assert_eq!(second.message.unwrap().task_id, "tasks:job");
    }

    #[tokio::test]
    async fn consumed_entries_are_dropped_once_every_group_is_done() {
        let transport = MemoryTransport::new();
        transport.ensure_group(STREAM, GROUP).await.unwrap();
        transport.ensure_group(STREAM, "audit").await.unwrap();
        let id = transport
            .append(STREAM, &DeliveryMessage::new("t1", json!({})))
            .await
            .unwrap();

        transport
            .read_group(GROUP, "w1", &streams(), Duration::ZERO)
            .await
            .unwrap();
        transport.ack(STREAM, GROUP, &id).await.unwrap();
        assert_eq!(transport.retained(STREAM).await, 1);

        transport
            .read_group("audit", "a1", &streams(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(transport.retained(STREAM).await, 1);
        transport.ack(STREAM, "audit", &id).await.unwrap();
        assert_eq!(transport.retained(STREAM).await, 0);
        assert_eq!(transport.stream_len(STREAM).await, 1);

        let next = transport
            .append(STREAM, &DeliveryMessage::new("t2", json!({})))
            .await
            .unwrap();
        assert_eq!(next, "2-0");
        let delivery = transport
            .read_group(GROUP, "w1", &streams(), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.entry_id, next);
    }

    #[tokio::test]
    async fn ack_log_keeps_only_recent_calls() {
        let transport = MemoryTransport::new();
        for n in 0..ACK_LOG_LIMIT + 5 {
            transport
                .ack(STREAM, GROUP, &format!("{n}-0"))
                .await
                .unwrap();
        }
        let acks = transport.acks().await;
        assert_eq!(acks.len(), ACK_LOG_LIMIT);
        assert_eq!(acks[0].entry_id, "5-0");
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_reader_wakes_on_append() {
        let transport = std::sync::Arc::new(MemoryTransport::new());
        transport.ensure_group(STREAM, GROUP).await.unwrap();

        let reader = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .read_group(GROUP, "w1", &streams(), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        transport
            .append(STREAM, &DeliveryMessage::new("t1", json!({})))
            .await
            .unwrap();

        let delivery = reader.await.unwrap().unwrap();
        assert!(delivery.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn read_times_out_when_idle() {
        let transport = MemoryTransport::new();
        transport.ensure_group(STREAM, GROUP).await.unwrap();
        let delivery = transport
            .read_group(GROUP, "w1", &streams(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(delivery.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entries_can_be_reclaimed() {
        let transport = MemoryTransport::new();
        transport.ensure_group(STREAM, GROUP).await.unwrap();
        let id = transport
            .append(STREAM, &DeliveryMessage::new("t1", json!({})))
            .await
            .unwrap();
        transport
            .read_group(GROUP, "w1", &streams(), Duration::ZERO)
            .await
            .unwrap();

        let early = transport
            .claim_stale(STREAM, GROUP, "w2", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(early.is_none());

        tokio::time::advance(Duration::from_secs(61)).await;
        let reclaimed = transport
            .claim_stale(STREAM, GROUP, "w2", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.entry_id, id);
    }

    #[tokio::test]
    async fn closed_transport_rejects_calls() {
        let transport = MemoryTransport::new();
        transport.close().await.unwrap();
        let err = transport
            .append(STREAM, &DeliveryMessage::new("t1", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
