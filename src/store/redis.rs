//! Redis task store.
//!
//! Each task is a hash at `task:{task_id}` holding the flat field encoding
//! from [`crate::store::fields`]. Creates run `HSET` + `EXPIRE` in one
//! `MULTI` block. Updates go through a Lua script so that the existence
//! check, the field writes, and the TTL refresh happen atomically.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use serde_json::Value;
use tracing::debug;

use crate::error::StoreError;
use crate::store::fields;
use crate::store::traits::{DEFAULT_TTL, TaskStore};
use crate::tasks::model::{TaskRecord, TaskType, TaskUpdate};

/// Key prefix for task hashes.
pub const TASK_PREFIX: &str = "task:";

/// Partial update that never recreates a missing or expired key.
///
/// KEYS[1] = task hash key.
/// ARGV[1] = ttl seconds, ARGV[2..] = field/value pairs.
/// Returns: 1 when applied, 0 when the key does not exist.
const LUA_UPDATE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
if #ARGV > 1 then
    redis.call('HSET', KEYS[1], unpack(ARGV, 2))
end
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[1]))
return 1
"#;

/// Task store backed by Redis hashes.
pub struct RedisTaskStore {
    conn: MultiplexedConnection,
    ttl: Duration,
    update_script: Script,
}

impl RedisTaskStore {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Connection(format!("Failed to create Redis client: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to connect to Redis: {e}")))?;
        Ok(Self::with_connection(conn))
    }

    /// Build a store over an existing multiplexed connection.
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            ttl: DEFAULT_TTL,
            update_script: Script::new(LUA_UPDATE),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn key(task_id: &str) -> String {
        format!("{TASK_PREFIX}{task_id}")
    }

    fn ttl_secs(&self) -> i64 {
        self.ttl.as_secs().max(1) as i64
    }
}

fn query_error(op: &str, key: &str, err: redis::RedisError) -> StoreError {
    StoreError::Query(format!("Redis {op} failed for {key}: {err}"))
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn create(
        &self,
        task_id: &str,
        task_type: TaskType,
        payload: Value,
    ) -> Result<TaskRecord, StoreError> {
        let record = TaskRecord::pending(task_id, task_type, payload);
        let key = Self::key(task_id);
        let encoded = fields::encode_record(&record)?;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset_multiple(&key, &encoded)
            .ignore()
            .expire(&key, self.ttl_secs())
            .ignore()
            .exec_async(&mut conn)
            .await
            .map_err(|e| query_error("create", &key, e))?;

        Ok(record)
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let key = Self::key(task_id);
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn
            .hgetall(&key)
            .await
            .map_err(|e| query_error("get", &key, e))?;

        if raw.is_empty() {
            return Ok(None);
        }
        fields::decode_record(&raw).map(Some)
    }

    async fn update(&self, task_id: &str, update: &TaskUpdate) -> Result<bool, StoreError> {
        let key = Self::key(task_id);
        let encoded = fields::encode_update(update)?;

        let mut invocation = self.update_script.key(&key);
        invocation.arg(self.ttl_secs());
        for (field, value) in &encoded {
            invocation.arg(*field).arg(value);
        }

        let mut conn = self.conn.clone();
        let applied: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| query_error("update", &key, e))?;

        if applied == 0 {
            debug!(task_id, "Update skipped, no live record");
        }
        Ok(applied == 1)
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}
