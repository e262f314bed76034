//! Task store: keyed task records with a sliding retention window.

pub mod fields;
pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod redis;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

pub use libsql_backend::LibSqlTaskStore;
pub use memory::MemoryTaskStore;
pub use self::redis::RedisTaskStore;
pub use traits::{DEFAULT_TTL, TaskStore};

/// Spawn a background task that purges expired records every `every`.
pub fn spawn_expiry_task(store: Arc<dyn TaskStore>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "Purged expired task records"),
                Err(e) => warn!(error = %e, "Task expiry sweep failed"),
            }
        }
    })
}
