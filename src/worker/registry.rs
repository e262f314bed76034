//! Registry mapping task types to worker factories.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::TaskError;
use crate::store::TaskStore;
use crate::tasks::model::TaskType;
use crate::worker::{Worker, WorkerContext};

/// Builds a worker for one delivered task.
pub type WorkerFactory = Arc<dyn Fn(WorkerContext) -> Box<dyn Worker> + Send + Sync>;

/// Explicit table of supported task types.
///
/// Filled once at startup, then shared read-only behind an `Arc`.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    factories: HashMap<TaskType, WorkerFactory>,
}

impl WorkerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for `task_type`, replacing any earlier one.
    pub fn register<F>(&mut self, task_type: TaskType, factory: F)
    where
        F: Fn(WorkerContext) -> Box<dyn Worker> + Send + Sync + 'static,
    {
        if self.factories.insert(task_type, Arc::new(factory)).is_some() {
            tracing::warn!(task_type = %task_type, "Replaced worker registration");
        } else {
            tracing::debug!("Registered worker: {}", task_type);
        }
    }

    /// Build the worker for a delivered task.
    pub fn resolve(
        &self,
        task_type: TaskType,
        task_id: &str,
        payload: Value,
        store: Arc<dyn TaskStore>,
    ) -> Result<Box<dyn Worker>, TaskError> {
        let factory = self
            .factories
            .get(&task_type)
            .ok_or_else(|| TaskError::UnknownTaskType(task_type.to_string()))?;
        Ok(factory(WorkerContext::new(task_id, task_type, payload, store)))
    }

    /// Registered types, in declaration order.
    pub fn task_types(&self) -> Vec<TaskType> {
        TaskType::ALL
            .into_iter()
            .filter(|t| self.factories.contains_key(t))
            .collect()
    }

    pub fn has(&self, task_type: TaskType) -> bool {
        self.factories.contains_key(&task_type)
    }

    pub fn count(&self) -> usize {
        self.factories.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use crate::store::MemoryTaskStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo(WorkerContext);

    #[async_trait]
    impl Worker for Echo {
        async fn run(&mut self) -> Result<Value, WorkerError> {
            Ok(self.0.payload().clone())
        }
    }

    #[tokio::test]
    async fn resolve_registered_type() {
        let mut registry = WorkerRegistry::new();
        registry.register(TaskType::Job, |ctx| Box::new(Echo(ctx)));
        assert!(registry.has(TaskType::Job));
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.task_types(), vec![TaskType::Job]);

        let mut worker = registry
            .resolve(
                TaskType::Job,
                "t1",
                json!({"x": 1}),
                Arc::new(MemoryTaskStore::new()),
            )
            .unwrap();
        assert_eq!(worker.run().await.unwrap(), json!({"x": 1}));
    }

    #[test]
    fn resolve_unknown_type_fails() {
        let registry = WorkerRegistry::new();
        let err = registry
            .resolve(TaskType::Ocr, "t1", json!({}), Arc::new(MemoryTaskStore::new()))
            .err()
            .unwrap();
        assert!(matches!(err, TaskError::UnknownTaskType(t) if t == "ocr"));
    }
}
