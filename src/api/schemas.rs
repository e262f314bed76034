//! Response bodies for the task endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tasks::model::{TaskRecord, TaskStatus, TaskType};

/// Body of a `202 Accepted` submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub poll_url: String,
}

impl From<&TaskRecord> for SubmitResponse {
    fn from(record: &TaskRecord) -> Self {
        Self {
            task_id: record.task_id.clone(),
            status: record.status,
            created_at: record.created_at,
            poll_url: format!("/ai/tasks/{}", record.task_id),
        }
    }
}

/// Body of `GET /ai/tasks/{task_id}`. Payload and result are left out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub task_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<TaskRecord> for StatusResponse {
    fn from(record: TaskRecord) -> Self {
        Self {
            task_id: record.task_id,
            task_type: record.task_type,
            status: record.status,
            progress: record.progress,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            error: record.error,
        }
    }
}
