//! Process wiring: open the configured store and transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{AppConfig, StoreBackend, TransportBackend};
use crate::error::Error;
use crate::store::{LibSqlTaskStore, MemoryTaskStore, RedisTaskStore, TaskStore, spawn_expiry_task};
use crate::tasks::Producer;
use crate::transport::{MemoryTransport, RedisTransport, StreamTransport};

const EXPIRY_SWEEP_EVERY: Duration = Duration::from_secs(60);

/// Opened store and transport shared by the API and the consumers.
pub struct Backends {
    pub store: Arc<dyn TaskStore>,
    pub transport: Arc<dyn StreamTransport>,
    sweeper: Option<JoinHandle<()>>,
}

impl Backends {
    /// Connect the store and transport named in `config`.
    pub async fn open(config: &AppConfig) -> Result<Self, Error> {
        let ttl = config.store.ttl;
        let mut sweeper = None;
        let store: Arc<dyn TaskStore> = match config.store.backend {
            StoreBackend::Redis => {
                Arc::new(RedisTaskStore::connect(&config.store.redis_url).await?.with_ttl(ttl))
            }
            StoreBackend::LibSql => {
                let store: Arc<dyn TaskStore> = Arc::new(
                    LibSqlTaskStore::new_local(&config.store.libsql_path)
                        .await?
                        .with_ttl(ttl),
                );
                sweeper = Some(spawn_expiry_task(store.clone(), EXPIRY_SWEEP_EVERY));
                store
            }
            StoreBackend::Memory => Arc::new(MemoryTaskStore::with_ttl(ttl)),
        };

        let transport: Arc<dyn StreamTransport> = match config.transport.backend {
            TransportBackend::Redis => {
                Arc::new(RedisTransport::connect(&config.transport.redis_url).await?)
            }
            TransportBackend::Memory => Arc::new(MemoryTransport::new()),
        };

        info!(
            store = ?config.store.backend,
            transport = ?config.transport.backend,
            ttl_secs = ttl.as_secs(),
            "Backends ready"
        );
        Ok(Self {
            store,
            transport,
            sweeper,
        })
    }

    /// Wrap already-open backends.
    pub fn new(store: Arc<dyn TaskStore>, transport: Arc<dyn StreamTransport>) -> Self {
        Self {
            store,
            transport,
            sweeper: None,
        }
    }

    pub fn producer(&self) -> Producer {
        Producer::new(self.store.clone(), self.transport.clone())
    }

    /// Stop the expiry sweep and release connections.
    pub async fn shutdown(mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Failed to close transport");
        }
        if let Err(e) = self.store.close().await {
            warn!(error = %e, "Failed to close task store");
        }
        info!("Backends closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::{TaskStatus, TaskType};
    use serde_json::json;

    fn memory_config() -> AppConfig {
        AppConfig::from_lookup(|key| match key {
            "TASKS_STORE" | "TASKS_TRANSPORT" => Some("memory".into()),
            _ => None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn memory_backends_round_trip_a_submission() {
        let backends = Backends::open(&memory_config()).await.unwrap();
        let record = backends
            .producer()
            .submit(TaskType::Job, json!({"k": 1}), Some("t1".into()))
            .await
            .unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert!(backends.store.get("t1").await.unwrap().is_some());
        backends.shutdown().await;
    }

    #[tokio::test]
    async fn libsql_backend_starts_sweeper() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = memory_config();
        config.store.backend = StoreBackend::LibSql;
        config.store.libsql_path = dir.path().join("nested/tasks.db");

        let backends = Backends::open(&config).await.unwrap();
        assert!(backends.sweeper.is_some());
        backends.shutdown().await;
        assert!(dir.path().join("nested/tasks.db").exists());
    }
}
