//! `TaskStore` trait for keyed task state with a sliding time-to-live.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;
use crate::tasks::model::{TaskRecord, TaskType, TaskUpdate};

/// Default retention window for task records.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Backend-agnostic storage for task records.
///
/// Every successful write pushes the record's expiry to `ttl()` from now.
/// Once expired, a record reads exactly as if it never existed.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Store a new pending record, replacing any record with the same id.
    async fn create(
        &self,
        task_id: &str,
        task_type: TaskType,
        payload: Value,
    ) -> Result<TaskRecord, StoreError>;

    /// Fetch a live record.
    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError>;

    /// Apply a partial update atomically and refresh the expiry, even when
    /// the update sets no fields.
    ///
    /// Returns `false` when no live record exists. Expired records are never
    /// recreated by an update.
    async fn update(&self, task_id: &str, update: &TaskUpdate) -> Result<bool, StoreError>;

    /// Retention window applied on every write.
    fn ttl(&self) -> Duration;

    /// Physically delete expired records. Returns how many were removed.
    ///
    /// Backends with native key expiry have nothing to do here.
    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }

    /// Release backend resources.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
