//! Concrete workers for the `hex`, `job` and `ocr` task types.

pub mod hex;
pub mod job;
pub mod ocr;
pub mod scoring;

use std::sync::Arc;

use crate::clients::{
    GitHubCollector, LanguageModel, OpenAiCompatClient, ProfileMetricsCollector,
    StaticMetricsCollector, TavilySearch, WebSearch,
};
use crate::config::AppConfig;
use crate::error::CollectorError;
use crate::tasks::model::TaskType;
use crate::worker::WorkerRegistry;

pub use hex::HexWorker;
pub use job::JobWorker;
pub use ocr::OcrWorker;

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub github: Arc<dyn ProfileMetricsCollector>,
    /// Used when a hex payload asks for mock metrics.
    pub mock_metrics: Arc<dyn ProfileMetricsCollector>,
    pub search: Arc<dyn WebSearch>,
    pub llm: Arc<dyn LanguageModel>,
}

impl WorkerDeps {
    /// Build the production collaborators from configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self, CollectorError> {
        let collaborators = &config.collaborators;
        let mock_metrics = match &collaborators.mock_features_path {
            Some(path) => StaticMetricsCollector::from_path(path)?,
            None => StaticMetricsCollector::default(),
        };
        Ok(Self {
            github: Arc::new(GitHubCollector::new(collaborators.github_token.clone())),
            mock_metrics: Arc::new(mock_metrics),
            search: Arc::new(TavilySearch::new(collaborators.tavily_api_key.clone())),
            llm: Arc::new(OpenAiCompatClient::from_config(&config.llm)),
        })
    }
}

/// Registry with every built-in worker.
pub fn default_registry(deps: WorkerDeps) -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();

    let hex_deps = deps.clone();
    registry.register(TaskType::Hex, move |ctx| {
        Box::new(HexWorker::new(
            ctx,
            hex_deps.github.clone(),
            hex_deps.mock_metrics.clone(),
            hex_deps.llm.clone(),
        ))
    });

    let job_deps = deps.clone();
    registry.register(TaskType::Job, move |ctx| {
        Box::new(JobWorker::new(ctx, job_deps.search.clone(), job_deps.llm.clone()))
    });

    registry.register(TaskType::Ocr, move |ctx| {
        Box::new(OcrWorker::new(ctx, deps.llm.clone()))
    });

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTaskStore;
    use serde_json::json;

    #[test]
    fn default_registry_covers_all_types() {
        let config = AppConfig::from_lookup(|_| None).unwrap();
        let registry = default_registry(WorkerDeps::from_config(&config).unwrap());
        assert_eq!(registry.task_types(), TaskType::ALL.to_vec());

        let store = Arc::new(MemoryTaskStore::new());
        for task_type in TaskType::ALL {
            assert!(
                registry
                    .resolve(task_type, "t1", json!({}), store.clone())
                    .is_ok()
            );
        }
    }

    #[test]
    fn missing_mock_features_file_is_an_error() {
        let mut config = AppConfig::from_lookup(|_| None).unwrap();
        config.collaborators.mock_features_path = Some("/nonexistent/features.json".into());
        assert!(matches!(
            WorkerDeps::from_config(&config),
            Err(CollectorError::Mock(_))
        ));
    }
}
