//! Per-task handle a worker uses to report lifecycle changes.

use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{StoreError, WorkerError};
use crate::store::TaskStore;
use crate::tasks::model::{PROGRESS_DONE, TaskRecord, TaskStatus, TaskType, TaskUpdate};
use crate::tasks::payload;

/// Everything a worker knows about the task it was built for.
///
/// Every lifecycle helper is a store mutation. Once the record is terminal,
/// `mark_running` refuses and the other helpers do nothing. The check reads
/// before it writes and is not a lock.
#[derive(Clone)]
pub struct WorkerContext {
    task_id: String,
    task_type: TaskType,
    payload: Value,
    store: Arc<dyn TaskStore>,
}

impl WorkerContext {
    pub fn new(
        task_id: impl Into<String>,
        task_type: TaskType,
        payload: Value,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_type,
            payload,
            store,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Decode the payload into the worker's own shape.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, WorkerError> {
        payload::decode(&self.payload).map_err(|e| WorkerError::InvalidInput(e.to_string()))
    }

    async fn current(&self) -> Result<Option<TaskRecord>, StoreError> {
        self.store.get(&self.task_id).await
    }

    async fn is_terminal(&self) -> Result<bool, StoreError> {
        Ok(self
            .current()
            .await?
            .is_some_and(|record| record.status.is_terminal()))
    }

    async fn write(&self, update: TaskUpdate) -> Result<(), StoreError> {
        if !self.store.update(&self.task_id, &update).await? {
            warn!(task_id = %self.task_id, "Task record missing or expired; update dropped");
        }
        Ok(())
    }

    /// Move the task to `running` and stamp `started_at`.
    pub async fn mark_running(&self) -> Result<(), WorkerError> {
        let record = self.current().await?;
        if let Some(record) = &record
            && record.status.is_terminal()
        {
            return Err(WorkerError::AlreadyTerminal {
                task_id: self.task_id.clone(),
                status: record.status.to_string(),
            });
        }

        let mut update = TaskUpdate::new().status(TaskStatus::Running);
        if record.is_none_or(|r| r.started_at.is_none()) {
            update = update.started_at(Utc::now());
        }
        self.write(update).await?;
        info!(task_id = %self.task_id, task_type = %self.task_type, "Task running");
        Ok(())
    }

    /// Record an advisory progress label. Last write wins.
    pub async fn update_progress(&self, label: &str) -> Result<(), WorkerError> {
        if self.is_terminal().await? {
            debug!(task_id = %self.task_id, label, "Skipping progress on terminal task");
            return Ok(());
        }
        self.write(TaskUpdate::new().progress(label)).await?;
        debug!(task_id = %self.task_id, label, "Task progress");
        Ok(())
    }

    /// Terminal success. Stores the result and clears any stale error.
    pub async fn mark_completed(&self, result: Value) -> Result<(), WorkerError> {
        if self.is_terminal().await? {
            debug!(task_id = %self.task_id, "Task already terminal; completion ignored");
            return Ok(());
        }
        self.write(
            TaskUpdate::new()
                .status(TaskStatus::Completed)
                .progress(PROGRESS_DONE)
                .result(result)
                .clear_error()
                .completed_at(Utc::now()),
        )
        .await?;
        info!(task_id = %self.task_id, task_type = %self.task_type, "Task completed");
        Ok(())
    }

    /// Terminal failure. Stores the error and clears any stale result.
    pub async fn mark_failed(&self, error: impl Into<String>) -> Result<(), WorkerError> {
        if self.is_terminal().await? {
            debug!(task_id = %self.task_id, "Task already terminal; failure ignored");
            return Ok(());
        }
        let error = error.into();
        self.write(
            TaskUpdate::new()
                .status(TaskStatus::Failed)
                .error(error.clone())
                .clear_result()
                .completed_at(Utc::now()),
        )
        .await?;
        warn!(task_id = %self.task_id, task_type = %self.task_type, error = %error, "Task failed");
        Ok(())
    }

    /// Record the outcome of a run as its terminal state and pass it through.
    pub async fn settle(
        &self,
        outcome: Result<Value, WorkerError>,
    ) -> Result<Value, WorkerError> {
        match outcome {
            Ok(result) => {
                self.mark_completed(result.clone()).await?;
                Ok(result)
            }
            Err(e) => {
                if let Err(store_err) = self.mark_failed(e.to_string()).await {
                    warn!(task_id = %self.task_id, error = %store_err, "Failed to record task failure");
                }
                Err(e)
            }
        }
    }
}
