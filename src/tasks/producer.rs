//! Task producer: durable pending record first, then the delivery message.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::Error;
use crate::store::TaskStore;
use crate::tasks::model::{DeliveryMessage, TaskRecord, TaskType};
use crate::transport::StreamTransport;

/// Submits tasks for asynchronous execution.
#[derive(Clone)]
pub struct Producer {
    store: Arc<dyn TaskStore>,
    transport: Arc<dyn StreamTransport>,
}

impl Producer {
    pub fn new(store: Arc<dyn TaskStore>, transport: Arc<dyn StreamTransport>) -> Self {
        Self { store, transport }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Create a pending record and enqueue it on `tasks:<type>`.
    ///
    /// A transport failure after the record is stored leaves the task
    /// pending forever. It is logged and returned, never retried.
    pub async fn submit(
        &self,
        task_type: TaskType,
        payload: Value,
        task_id: Option<String>,
    ) -> Result<TaskRecord, Error> {
        let task_id = task_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let record = self.store.create(&task_id, task_type, payload.clone()).await?;

        let stream = task_type.stream_name();
        let message = DeliveryMessage::new(task_id.clone(), payload);
        match self.transport.append(&stream, &message).await {
            Ok(entry_id) => {
                debug!(task_id = %task_id, stream = %stream, entry_id = %entry_id, "Appended delivery message");
                info!(task_id = %task_id, task_type = %task_type, "Task submitted");
                Ok(record)
            }
            Err(e) => {
                error!(
                    task_id = %task_id,
                    task_type = %task_type,
                    error = %e,
                    "Delivery append failed; task will stay pending"
                );
                Err(e.into())
            }
        }
    }

    /// Fetch a task's current record.
    pub async fn status(&self, task_id: &str) -> Result<Option<TaskRecord>, Error> {
        Ok(self.store.get(task_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTaskStore;
    use crate::tasks::model::TaskStatus;
    use crate::transport::MemoryTransport;
    use serde_json::json;

    fn producer() -> (Producer, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let producer = Producer::new(Arc::new(MemoryTaskStore::new()), transport.clone());
        (producer, transport)
    }

    #[tokio::test]
    async fn submit_creates_pending_record_and_appends() {
        let (producer, transport) = producer();
        let record = producer
            .submit(TaskType::Job, json!({"company": "acme"}), None)
            .await
            .unwrap();

        assert_eq!(record.status, TaskStatus::Pending);
        assert!(Uuid::parse_str(&record.task_id).is_ok());
        assert_eq!(transport.stream_len("tasks:job").await, 1);

        let stored = producer.status(&record.task_id).await.unwrap().unwrap();
        assert_eq!(stored.payload, json!({"company": "acme"}));
        assert!(stored.started_at.is_none());
    }

    #[tokio::test]
    async fn explicit_id_is_kept() {
        let (producer, _) = producer();
        let record = producer
            .submit(TaskType::Ocr, json!({}), Some("fixed-id".into()))
            .await
            .unwrap();
        assert_eq!(record.task_id, "fixed-id");
    }

    #[tokio::test]
    async fn append_failure_leaves_record_pending() {
        let (producer, transport) = producer();
        transport.close().await.unwrap();

        let err = producer
            .submit(TaskType::Hex, json!({}), Some("stuck".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));

        let record = producer.status("stuck").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
    }
}
