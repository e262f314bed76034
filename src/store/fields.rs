//! Flat field encoding shared by the hash-style backends.
//!
//! Every record field becomes one string value. Nested JSON is encoded at the
//! field level, timestamps are RFC 3339, and absent optionals are `""`.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::error::{StoreError, TaskError};
use crate::tasks::model::{TaskRecord, TaskStatus, TaskType, TaskUpdate};

pub const TASK_ID: &str = "task_id";
pub const TASK_TYPE: &str = "task_type";
pub const STATUS: &str = "status";
pub const PROGRESS: &str = "progress";
pub const PAYLOAD: &str = "payload";
pub const RESULT: &str = "result";
pub const ERROR: &str = "error";
pub const CREATED_AT: &str = "created_at";
pub const STARTED_AT: &str = "started_at";
pub const COMPLETED_AT: &str = "completed_at";

/// Field list, in storage order.
pub const ALL: [&str; 10] = [
    TASK_ID,
    TASK_TYPE,
    STATUS,
    PROGRESS,
    PAYLOAD,
    RESULT,
    ERROR,
    CREATED_AT,
    STARTED_AT,
    COMPLETED_AT,
];

pub type Fields = Vec<(&'static str, String)>;

fn encode_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn encode_opt_time(at: &Option<DateTime<Utc>>) -> String {
    at.as_ref().map(encode_time).unwrap_or_default()
}

fn encode_opt_json(value: &Option<Value>) -> Result<String, StoreError> {
    match value {
        Some(v) => Ok(serde_json::to_string(v)?),
        None => Ok(String::new()),
    }
}

/// Encode a full record.
pub fn encode_record(record: &TaskRecord) -> Result<Fields, StoreError> {
    Ok(vec![
        (TASK_ID, record.task_id.clone()),
        (TASK_TYPE, record.task_type.as_str().to_string()),
        (STATUS, record.status.as_str().to_string()),
        (PROGRESS, record.progress.clone().unwrap_or_default()),
        (PAYLOAD, serde_json::to_string(&record.payload)?),
        (RESULT, encode_opt_json(&record.result)?),
        (ERROR, record.error.clone().unwrap_or_default()),
        (CREATED_AT, encode_time(&record.created_at)),
        (STARTED_AT, encode_opt_time(&record.started_at)),
        (COMPLETED_AT, encode_opt_time(&record.completed_at)),
    ])
}

/// Encode only the fields an update touches. Cleared fields encode as `""`.
pub fn encode_update(update: &TaskUpdate) -> Result<Fields, StoreError> {
    let mut fields = Vec::new();
    if let Some(status) = update.status {
        fields.push((STATUS, status.as_str().to_string()));
    }
    if let Some(progress) = &update.progress {
        fields.push((PROGRESS, progress.clone()));
    }
    if let Some(result) = &update.result {
        fields.push((RESULT, encode_opt_json(result)?));
    }
    if let Some(error) = &update.error {
        fields.push((ERROR, error.clone().unwrap_or_default()));
    }
    if let Some(at) = &update.started_at {
        fields.push((STARTED_AT, encode_time(at)));
    }
    if let Some(at) = &update.completed_at {
        fields.push((COMPLETED_AT, encode_time(at)));
    }
    Ok(fields)
}

/// Decode a stored field map back into a record.
pub fn decode_record(fields: &HashMap<String, String>) -> Result<TaskRecord, StoreError> {
    let task_id = non_empty(fields, TASK_ID)
        .ok_or_else(|| corrupt("<unknown>", "missing task_id"))?
        .to_string();

    let task_type: TaskType = required(fields, &task_id, TASK_TYPE)?
        .parse()
        .map_err(|e: TaskError| corrupt(&task_id, &e.to_string()))?;
    let status: TaskStatus = required(fields, &task_id, STATUS)?
        .parse()
        .map_err(|e: String| corrupt(&task_id, &e))?;
    let created_at = parse_time(&task_id, required(fields, &task_id, CREATED_AT)?)?;

    let payload = match non_empty(fields, PAYLOAD) {
        Some(raw) => serde_json::from_str(raw)?,
        None => Value::Object(Default::default()),
    };
    let result = non_empty(fields, RESULT)
        .map(serde_json::from_str)
        .transpose()?;

    Ok(TaskRecord {
        task_type,
        status,
        progress: non_empty(fields, PROGRESS).map(str::to_string),
        payload,
        result,
        error: non_empty(fields, ERROR).map(str::to_string),
        created_at,
        started_at: non_empty(fields, STARTED_AT)
            .map(|s| parse_time(&task_id, s))
            .transpose()?,
        completed_at: non_empty(fields, COMPLETED_AT)
            .map(|s| parse_time(&task_id, s))
            .transpose()?,
        task_id,
    })
}

fn non_empty<'a>(fields: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .filter(|s| !s.is_empty())
}

fn required<'a>(
    fields: &'a HashMap<String, String>,
    task_id: &str,
    name: &str,
) -> Result<&'a str, StoreError> {
    non_empty(fields, name).ok_or_else(|| corrupt(task_id, &format!("missing {name}")))
}

fn parse_time(task_id: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt(task_id, &format!("bad timestamp '{raw}': {e}")))
}

fn corrupt(task_id: &str, reason: &str) -> StoreError {
    StoreError::Corrupt {
        task_id: task_id.to_string(),
        reason: reason.to_string(),
    }
}
