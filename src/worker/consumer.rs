//! Grouped stream consumer.
//!
//! Each cycle claims at most one message across the configured task-type
//! streams, resolves its worker, runs it to the end and then acknowledges the
//! message no matter how the run went. Nothing delivered is ever retried
//! here. Transient transport and store errors are logged and followed by a
//! backoff sleep.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{Error, TaskError};
use crate::store::TaskStore;
use crate::tasks::model::{TaskStatus, TaskType, TaskUpdate};
use crate::transport::{Delivery, StreamTransport};
use crate::worker::WorkerRegistry;

/// Default consumer group shared by all worker processes.
pub const DEFAULT_GROUP: &str = "ai-workers";

/// Consumer loop settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group: String,
    /// Consumer name within the group, unique per process.
    pub name: String,
    /// How long one pull waits for new messages.
    pub block: Duration,
    /// Sleep after a transient loop error.
    pub error_backoff: Duration,
    /// Reclaim pending messages idle this long. `None` disables reclaim.
    pub reclaim_idle: Option<Duration>,
}

impl ConsumerConfig {
    /// A consumer name of the form `worker-1a2b3c4d`.
    pub fn generate_name() -> String {
        format!("worker-{:08x}", rand::random::<u32>())
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP.to_string(),
            name: Self::generate_name(),
            block: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
            reclaim_idle: None,
        }
    }
}

/// Observable consumer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Pulling,
    Dispatching,
    Stopped,
}

/// How a delivered message was handled. It is acknowledged in every case.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// The worker returned a result.
    Completed,
    /// The worker returned an error.
    WorkerFailed(String),
    /// The worker panicked.
    Panicked(String),
    /// No worker is registered for the task type. The record was marked failed.
    UnknownType,
    /// The message could not be decoded.
    Malformed(String),
}

/// Result of one poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Nothing arrived within the block timeout.
    Idle,
    /// One message was dispatched and acknowledged.
    Dispatched {
        stream: String,
        entry_id: String,
        task_id: Option<String>,
        disposition: Disposition,
    },
}

/// Pulls task messages for a set of types and runs their workers.
pub struct Consumer {
    transport: Arc<dyn StreamTransport>,
    store: Arc<dyn TaskStore>,
    registry: Arc<WorkerRegistry>,
    config: ConsumerConfig,
    streams: Vec<String>,
    state: watch::Sender<ConsumerState>,
    stopping: AtomicBool,
}

impl Consumer {
    /// Build a consumer for `task_types`. An empty list serves every
    /// registered type.
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        store: Arc<dyn TaskStore>,
        registry: Arc<WorkerRegistry>,
        config: ConsumerConfig,
        task_types: &[TaskType],
    ) -> Self {
        let types = if task_types.is_empty() {
            registry.task_types()
        } else {
            task_types.to_vec()
        };
        let streams = types.iter().map(TaskType::stream_name).collect();
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            transport,
            store,
            registry,
            config,
            streams,
            state,
            stopping: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn streams(&self) -> &[String] {
        &self.streams
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Ask the loop to stop after the current cycle.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    /// Make sure the consumer group exists on every served stream.
    pub async fn ensure_groups(&self) -> Result<(), Error> {
        for stream in &self.streams {
            self.transport
                .ensure_group(stream, &self.config.group)
                .await?;
        }
        Ok(())
    }

    /// Run until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        while !self.is_stopping() {
            match self.ensure_groups().await {
                Ok(()) => break,
                Err(e) => {
                    error!(error = %e, "Failed to create consumer groups; retrying");
                    tokio::time::sleep(self.config.error_backoff).await;
                }
            }
        }

        info!(
            consumer = %self.config.name,
            group = %self.config.group,
            streams = ?self.streams,
            "Consumer started"
        );

        while !self.is_stopping() {
            if let Err(e) = self.consume_once().await {
                error!(consumer = %self.config.name, error = %e, "Consumer loop error; backing off");
                self.set_state(ConsumerState::Idle);
                tokio::time::sleep(self.config.error_backoff).await;
            }
        }

        self.set_state(ConsumerState::Stopped);
        info!(consumer = %self.config.name, "Consumer stopped");
    }

    /// One poll cycle: pull at most one message, dispatch it, acknowledge it.
    pub async fn consume_once(&self) -> Result<CycleOutcome, Error> {
        self.set_state(ConsumerState::Pulling);
        let pulled = self
            .transport
            .read_group(
                &self.config.group,
                &self.config.name,
                &self.streams,
                self.config.block,
            )
            .await?;

        let delivery = match pulled {
            Some(delivery) => delivery,
            None => match self.reclaim_stale().await? {
                Some(delivery) => delivery,
                None => {
                    self.set_state(ConsumerState::Idle);
                    debug!(consumer = %self.config.name, "No messages");
                    return Ok(CycleOutcome::Idle);
                }
            },
        };

        self.set_state(ConsumerState::Dispatching);
        let (task_id, disposition) = self.dispatch(&delivery).await;

        let acked = self
            .transport
            .ack(&delivery.stream, &self.config.group, &delivery.entry_id)
            .await;
        self.set_state(ConsumerState::Idle);
        acked?;
        debug!(stream = %delivery.stream, entry_id = %delivery.entry_id, "Acknowledged");

        Ok(CycleOutcome::Dispatched {
            stream: delivery.stream,
            entry_id: delivery.entry_id,
            task_id,
            disposition,
        })
    }

    async fn reclaim_stale(&self) -> Result<Option<Delivery>, Error> {
        let Some(min_idle) = self.config.reclaim_idle else {
            return Ok(None);
        };
        for stream in &self.streams {
            if let Some(delivery) = self
                .transport
                .claim_stale(stream, &self.config.group, &self.config.name, min_idle)
                .await?
            {
                warn!(stream = %stream, entry_id = %delivery.entry_id, "Reclaimed stale message");
                return Ok(Some(delivery));
            }
        }
        Ok(None)
    }

    async fn dispatch(&self, delivery: &Delivery) -> (Option<String>, Disposition) {
        let message = match &delivery.message {
            Ok(message) => message,
            Err(reason) => {
                warn!(
                    stream = %delivery.stream,
                    entry_id = %delivery.entry_id,
                    reason = %reason,
                    "Dropping malformed message"
                );
                return (None, Disposition::Malformed(reason.clone()));
            }
        };
        let task_id = message.task_id.clone();

        let resolved = TaskType::from_stream_name(&delivery.stream)
            .ok_or_else(|| TaskError::UnknownTaskType(delivery.stream.clone()))
            .and_then(|task_type| {
                self.registry.resolve(
                    task_type,
                    &task_id,
                    message.payload.clone(),
                    self.store.clone(),
                )
            });
        let mut worker = match resolved {
            Ok(worker) => worker,
            Err(e) => {
                warn!(task_id = %task_id, stream = %delivery.stream, error = %e, "No worker for task");
                self.fail_unknown(&task_id, &e).await;
                return (Some(task_id), Disposition::UnknownType);
            }
        };

        debug!(task_id = %task_id, stream = %delivery.stream, "Dispatching task");
        let disposition = match AssertUnwindSafe(worker.run()).catch_unwind().await {
            Ok(Ok(_)) => Disposition::Completed,
            Ok(Err(e)) => {
                warn!(task_id = %task_id, error = %e, "Worker returned an error");
                Disposition::WorkerFailed(e.to_string())
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(task_id = %task_id, panic = %reason, "Worker panicked");
                Disposition::Panicked(reason)
            }
        };
        (Some(task_id), disposition)
    }

    async fn fail_unknown(&self, task_id: &str, err: &TaskError) {
        let update = TaskUpdate::new()
            .status(TaskStatus::Failed)
            .error(err.to_string())
            .clear_result()
            .completed_at(Utc::now());
        if let Err(e) = self.store.update(task_id, &update).await {
            error!(task_id = %task_id, error = %e, "Failed to mark task failed");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
