//! Task record, status state machine, and delivery message.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{TaskError, TransportError};

/// Prefix for per-type stream names (`tasks:hex`, `tasks:job`, ...).
pub const STREAM_PREFIX: &str = "tasks:";

/// Progress label written by a successful completion.
pub const PROGRESS_DONE: &str = "done";

/// Kind of analysis a task performs. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Developer profile scoring.
    Hex,
    /// Self-introduction generation backed by web search.
    Job,
    /// Business-card extraction from an image.
    Ocr,
}

impl TaskType {
    pub const ALL: [TaskType; 3] = [TaskType::Hex, TaskType::Job, TaskType::Ocr];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hex => "hex",
            Self::Job => "job",
            Self::Ocr => "ocr",
        }
    }

    /// Name of the stream that carries deliveries for this type.
    pub fn stream_name(&self) -> String {
        format!("{STREAM_PREFIX}{}", self.as_str())
    }

    /// Inverse of [`TaskType::stream_name`].
    pub fn from_stream_name(stream: &str) -> Option<Self> {
        stream.strip_prefix(STREAM_PREFIX)?.parse().ok()
    }
}

impl FromStr for TaskType {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hex" => Ok(Self::Hex),
            "job" => Ok(Self::Job),
            "ocr" => Ok(Self::Ocr),
            other => Err(TaskError::UnknownTaskType(other.to_string())),
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Stored and enqueued, not yet picked up.
    Pending,
    /// A worker is executing it.
    Running,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
}

impl TaskStatus {
    /// Check if this status allows moving to `target`.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Completed) | (Pending, Failed) |
            // redelivered work may restart a running task
            (Running, Running) | (Running, Completed) | (Running, Failed)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable state of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub progress: Option<String>,
    /// Opaque job input. Only the worker for `task_type` interprets it.
    pub payload: Value,
    /// Set only when `status` is completed.
    pub result: Option<Value>,
    /// Set only when `status` is failed.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// A freshly submitted task.
    pub fn pending(task_id: impl Into<String>, task_type: TaskType, payload: Value) -> Self {
        Self {
            task_id: task_id.into(),
            task_type,
            status: TaskStatus::Pending,
            progress: None,
            payload,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, update: &TaskUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(progress) = &update.progress {
            self.progress = Some(progress.clone());
        }
        if let Some(result) = &update.result {
            self.result = result.clone();
        }
        if let Some(error) = &update.error {
            self.error = error.clone();
        }
        if let Some(started_at) = update.started_at {
            self.started_at = Some(started_at);
        }
        if let Some(completed_at) = update.completed_at {
            self.completed_at = Some(completed_at);
        }
    }
}

/// Partial update of a [`TaskRecord`].
///
/// Unset fields are left untouched by the store. `result` and `error` can
/// also be cleared explicitly, which stores them as absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<String>,
    pub result: Option<Option<Value>>,
    pub error: Option<Option<String>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: impl Into<String>) -> Self {
        self.progress = Some(progress.into());
        self
    }

    pub fn result(mut self, result: Value) -> Self {
        self.result = Some(Some(result));
        self
    }

    pub fn clear_result(mut self) -> Self {
        self.result = Some(None);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    /// True when applying this update would change nothing.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.progress.is_none()
            && self.result.is_none()
            && self.error.is_none()
            && self.started_at.is_none()
            && self.completed_at.is_none()
    }
}

/// Message appended to a task-type stream for each submission.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryMessage {
    pub task_id: String,
    pub payload: Value,
}

impl DeliveryMessage {
    pub fn new(task_id: impl Into<String>, payload: Value) -> Self {
        Self {
            task_id: task_id.into(),
            payload,
        }
    }

    /// Stream entry fields. The payload travels JSON-encoded.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, serde_json::Error> {
        Ok(vec![
            ("task_id", self.task_id.clone()),
            ("payload", serde_json::to_string(&self.payload)?),
        ])
    }

    /// Decode a stream entry. A missing payload decodes as an empty object.
    pub fn from_fields(
        stream: &str,
        entry_id: &str,
        fields: &HashMap<String, String>,
    ) -> Result<Self, TransportError> {
        let malformed = |reason: String| TransportError::Malformed {
            stream: stream.to_string(),
            entry_id: entry_id.to_string(),
            reason,
        };

        let task_id = fields
            .get("task_id")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| malformed("missing task_id".to_string()))?
            .clone();

        let payload = match fields.get("payload").map(String::as_str) {
            None | Some("") => Value::Object(Default::default()),
            Some(raw) => {
                serde_json::from_str(raw).map_err(|e| malformed(format!("bad payload: {e}")))?
            }
        };

        Ok(Self { task_id, payload })
    }
}
