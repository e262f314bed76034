//! Outbound collaborators used by the workers.
//!
//! Each collaborator sits behind a trait so workers can be exercised with
//! in-process stand-ins:
//! - **Profile metrics**: [`GitHubCollector`] or [`StaticMetricsCollector`]
//! - **Web search**: [`TavilySearch`]
//! - **Language model**: [`OpenAiCompatClient`] for vLLM and other
//!   OpenAI-compatible endpoints

pub mod github;
pub mod llm;
pub mod search;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{CollectorError, SearchError};

pub use github::{GitHubCollector, StaticMetricsCollector};
pub use llm::{OpenAiCompatClient, extract_json};
pub use search::TavilySearch;

/// Finish an HTTP client. A builder that fails is reported and replaced by
/// reqwest's defaults, which carry no request timeout.
pub(crate) fn http_client(
    builder: reqwest::ClientBuilder,
    client: &'static str,
) -> reqwest::Client {
    builder.build().unwrap_or_else(|e| {
        warn!(client, error = %e, "HTTP client setup failed, using defaults without a timeout");
        reqwest::Client::new()
    })
}

/// Fixed-shape activity metrics for one developer profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileFeatures {
    pub repo_count: u64,
    pub pull_requests_opened: u64,
    pub pull_requests_merged: u64,
    pub pr_reviews_submitted: u64,
    pub issue_comments_written: u64,
    pub language_diversity: u64,
    /// Percent of sampled repositories with a README.
    pub readme_coverage: u64,
    /// Percent of opened pull requests that were merged.
    pub merge_rate: u64,
    pub commit_events: u64,
    /// Days since the most recent public event.
    pub recent_activity_days: Option<i64>,
    /// Standard deviation of daily event counts inside the window.
    pub activity_stddev: Option<f64>,
}

/// Source of profile metrics.
#[async_trait]
pub trait ProfileMetricsCollector: Send + Sync {
    async fn collect_features(
        &self,
        username: &str,
        window_days: u32,
    ) -> Result<ProfileFeatures, CollectorError>;
}

/// One web search result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub url: String,
    /// Provider relevance score in `0.0..=1.0`.
    pub relevance: f64,
}

/// Web search provider. An unconfigured provider returns no hits.
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, SearchError>;
}

/// What to send to the model.
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    /// A single user prompt.
    Text(String),
    /// Raw chat messages, possibly multimodal.
    Messages(Vec<Value>),
}

/// A JSON-producing chat completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub prompt: Prompt,
    /// Ask for a JSON object and treat unparsable output as retryable.
    pub strict_json: bool,
    /// Overrides the configured model.
    pub model: Option<String>,
    pub temperature: Option<f64>,
    /// Extra top-level fields merged into the request body.
    pub extra_body: Map<String, Value>,
}

impl LlmRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self::with_prompt(Prompt::Text(prompt.into()))
    }

    pub fn messages(messages: Vec<Value>) -> Self {
        Self::with_prompt(Prompt::Messages(messages))
    }

    fn with_prompt(prompt: Prompt) -> Self {
        Self {
            prompt,
            strict_json: true,
            model: None,
            temperature: None,
            extra_body: Map::new(),
        }
    }

    pub fn strict_json(mut self, strict: bool) -> Self {
        self.strict_json = strict;
        self
    }

    pub fn model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra_body.insert(key.into(), value);
        self
    }
}

/// Language model that answers with a JSON object.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Returns `None` when the model is unconfigured, retries are exhausted,
    /// or the output never parsed as JSON.
    async fn generate_json(&self, request: LlmRequest) -> Option<Value>;
}
