//! Worker system: the per-task contract, the type registry, and the
//! grouped stream consumer that dispatches to it.
//!
//! - `context`: lifecycle helpers backed by the task store
//! - `registry`: task type to worker factory table
//! - `consumer`: pull, dispatch, acknowledge loop

pub mod consumer;
pub mod context;
pub mod registry;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::WorkerError;

pub use consumer::{Consumer, ConsumerConfig, ConsumerState, CycleOutcome, Disposition};
pub use context::WorkerContext;
pub use registry::{WorkerFactory, WorkerRegistry};

/// Business logic for one task type.
///
/// `run` must end every path in exactly one of
/// [`WorkerContext::mark_completed`] or [`WorkerContext::mark_failed`],
/// usually through [`WorkerContext::settle`]. Returning an error without
/// doing so leaves the task `running`.
#[async_trait]
pub trait Worker: Send {
    async fn run(&mut self) -> Result<Value, WorkerError>;
}
