//! libSQL task store backed by a local file or an in-memory database.
//!
//! Rows mirror the flat field encoding used by the Redis store, plus an
//! `expires_at` column in epoch milliseconds. Reads and updates ignore
//! expired rows; [`LibSqlTaskStore::purge_expired`] deletes them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, Value as SqlValue};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::fields::{self, Fields};
use crate::store::migrations;
use crate::store::traits::{DEFAULT_TTL, TaskStore};
use crate::tasks::model::{TaskRecord, TaskType, TaskUpdate};

/// libSQL task store.
///
/// Holds one connection reused for all operations.
pub struct LibSqlTaskStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    ttl: Duration,
}

impl LibSqlTaskStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Task database opened");
        Ok(store)
    }

    /// Create an in-memory database.
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            ttl: DEFAULT_TTL,
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn expires_at(&self) -> i64 {
        Utc::now().timestamp_millis() + self.ttl.as_millis() as i64
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn text_params(fields: Fields) -> Vec<SqlValue> {
    fields
        .into_iter()
        .map(|(_, value)| SqlValue::Text(value))
        .collect()
}

fn select_sql() -> String {
    format!(
        "SELECT {} FROM tasks WHERE task_id = ?1 AND expires_at > ?2",
        fields::ALL.join(", ")
    )
}

fn insert_sql() -> String {
    let placeholders: Vec<String> = (1..=fields::ALL.len() + 1)
        .map(|i| format!("?{i}"))
        .collect();
    format!(
        "INSERT OR REPLACE INTO tasks ({}, expires_at) VALUES ({})",
        fields::ALL.join(", "),
        placeholders.join(", ")
    )
}

/// `UPDATE` touching only the given columns, plus `expires_at`.
fn update_sql(columns: &[&str]) -> String {
    let mut assignments: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, column)| format!("{column} = ?{}", i + 1))
        .collect();
    let n = columns.len();
    assignments.push(format!("expires_at = ?{}", n + 1));
    format!(
        "UPDATE tasks SET {} WHERE task_id = ?{} AND expires_at > ?{}",
        assignments.join(", "),
        n + 2,
        n + 3
    )
}

// ── TaskStore implementation ────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlTaskStore {
    async fn create(
        &self,
        task_id: &str,
        task_type: TaskType,
        payload: Value,
    ) -> Result<TaskRecord, StoreError> {
        let record = TaskRecord::pending(task_id, task_type, payload);
        let mut params = text_params(fields::encode_record(&record)?);
        params.push(SqlValue::Integer(self.expires_at()));

        self.conn
            .execute(&insert_sql(), libsql::params_from_iter(params))
            .await
            .map_err(|e| StoreError::Query(format!("Failed to insert task {task_id}: {e}")))?;

        Ok(record)
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let mut rows = self
            .conn
            .query(&select_sql(), libsql::params![task_id, now_ms()])
            .await
            .map_err(|e| StoreError::Query(format!("Failed to query task {task_id}: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("Failed to read task {task_id}: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut raw = HashMap::with_capacity(fields::ALL.len());
        for (i, name) in fields::ALL.iter().enumerate() {
            let value: String = row.get(i as i32).map_err(|e| {
                StoreError::Query(format!("Failed to read column {name} of {task_id}: {e}"))
            })?;
            raw.insert(name.to_string(), value);
        }
        fields::decode_record(&raw).map(Some)
    }

    async fn update(&self, task_id: &str, update: &TaskUpdate) -> Result<bool, StoreError> {
        let encoded = fields::encode_update(update)?;
        let columns: Vec<&str> = encoded.iter().map(|(column, _)| *column).collect();
        let mut params = text_params(encoded);
        params.push(SqlValue::Integer(self.expires_at()));
        params.push(SqlValue::Text(task_id.to_string()));
        params.push(SqlValue::Integer(now_ms()));

        let affected = self
            .conn
            .execute(&update_sql(&columns), libsql::params_from_iter(params))
            .await
            .map_err(|e| StoreError::Query(format!("Failed to update task {task_id}: {e}")))?;

        if affected == 0 {
            debug!(task_id, "Update skipped, no live record");
        }
        Ok(affected > 0)
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM tasks WHERE expires_at <= ?1",
                libsql::params![now_ms()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("Failed to purge expired tasks: {e}")))?;
        Ok(removed as usize)
    }
}
