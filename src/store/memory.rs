//! In-process task store.
//!
//! Expiry is tracked with `tokio::time::Instant`, so tests can drive the TTL
//! with a paused clock.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::store::traits::{DEFAULT_TTL, TaskStore};
use crate::tasks::model::{TaskRecord, TaskType, TaskUpdate};

struct Entry {
    record: TaskRecord,
    expires_at: Instant,
}

/// Task store backed by a map in process memory.
pub struct MemoryTaskStore {
    entries: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Number of entries held, expired ones included until purged.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(
        &self,
        task_id: &str,
        task_type: TaskType,
        payload: Value,
    ) -> Result<TaskRecord, StoreError> {
        let record = TaskRecord::pending(task_id, task_type, payload);
        self.entries.write().await.insert(
            task_id.to_string(),
            Entry {
                record: record.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(record)
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(task_id)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.record.clone()))
    }

    async fn update(&self, task_id: &str, update: &TaskUpdate) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get(task_id).map(|entry| entry.expires_at > now) {
            None => Ok(false),
            Some(false) => {
                entries.remove(task_id);
                Ok(false)
            }
            Some(true) => {
                if let Some(entry) = entries.get_mut(task_id) {
                    entry.record.apply(update);
                    entry.expires_at = now + self.ttl;
                }
                Ok(true)
            }
        }
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(before - entries.len())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.entries.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::TaskStatus;
    use serde_json::json;

    #[tokio::test]
    async fn create_then_get() {
        let store = MemoryTaskStore::new();
        let created = store
            .create("t1", TaskType::Hex, json!({"github_username": "octocat"}))
            .await
            .unwrap();
        assert_eq!(created.status, TaskStatus::Pending);

        let fetched = store.get("t1").await.unwrap().unwrap();
        assert_eq!(fetched, created);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_overwrites_existing() {
        let store = MemoryTaskStore::new();
        store.create("t1", TaskType::Job, json!({"v": 1})).await.unwrap();
        store
            .update("t1", &TaskUpdate::new().status(TaskStatus::Running))
            .await
            .unwrap();
        store.create("t1", TaskType::Job, json!({"v": 2})).await.unwrap();

        let record = store.get("t1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.payload, json!({"v": 2}));
    }

    #[tokio::test]
    async fn update_missing_returns_false() {
        let store = MemoryTaskStore::new();
        let applied = store
            .update("ghost", &TaskUpdate::new().progress("x"))
            .await
            .unwrap();
        assert!(!applied);
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn record_expires_after_ttl() {
        let store = MemoryTaskStore::with_ttl(Duration::from_secs(10));
        store.create("t1", TaskType::Ocr, json!({})).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.get("t1").await.unwrap().is_none());
        assert!(
            !store
                .update("t1", &TaskUpdate::new().progress("late"))
                .await
                .unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn updates_slide_the_ttl() {
        let store = MemoryTaskStore::with_ttl(Duration::from_secs(10));
        store.create("t1", TaskType::Ocr, json!({})).await.unwrap();

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(8)).await;
            assert!(
                store
                    .update("t1", &TaskUpdate::new().progress("tick"))
                    .await
                    .unwrap()
            );
        }
        // 24s since creation, 8s since the last write.
        assert!(store.get("t1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.get("t1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_update_still_slides_the_ttl() {
        let store = MemoryTaskStore::with_ttl(Duration::from_secs(10));
        store.create("t1", TaskType::Ocr, json!({})).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.update("t1", &TaskUpdate::new()).await.unwrap());
        tokio::time::advance(Duration::from_secs(8)).await;

        let record = store.get("t1").await.unwrap().unwrap();
        assert_eq!(record.progress, None);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_expired_only() {
        let store = MemoryTaskStore::with_ttl(Duration::from_secs(5));
        store.create("old", TaskType::Hex, json!({})).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        store.create("new", TaskType::Hex, json!({})).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
        assert!(store.get("new").await.unwrap().is_some());
    }
}
