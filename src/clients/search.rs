//! Tavily web search.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::clients::{SearchHit, WebSearch, http_client};
use crate::error::SearchError;

const TAVILY_URL: &str = "https://api.tavily.com/search";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    score: Option<f64>,
}

impl From<TavilyResult> for SearchHit {
    fn from(r: TavilyResult) -> Self {
        Self {
            title: r.title,
            snippet: r.content,
            url: r.url,
            relevance: r.score.unwrap_or(0.0),
        }
    }
}

/// Tavily search client. Without an API key every search returns no hits.
pub struct TavilySearch {
    client: reqwest::Client,
    api_key: Option<SecretString>,
    url: String,
}

impl TavilySearch {
    pub fn new(api_key: Option<SecretString>) -> Self {
        let client = http_client(reqwest::Client::builder().timeout(REQUEST_TIMEOUT), "tavily");
        Self {
            client,
            api_key,
            url: TAVILY_URL.to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

fn request_failed(reason: impl ToString) -> SearchError {
    SearchError::RequestFailed {
        provider: "tavily".into(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl WebSearch for TavilySearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, SearchError> {
        let Some(api_key) = &self.api_key else {
            tracing::debug!("Tavily API key not set; skipping web search");
            return Ok(Vec::new());
        };

        let body = serde_json::json!({
            "api_key": api_key.expose_secret(),
            "query": query,
            "max_results": max_results,
            "search_depth": "basic",
            "include_answer": false,
            "include_raw_content": false,
            "include_images": false,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(request_failed)?;
        let status = response.status();
        if !status.is_success() {
            return Err(request_failed(format!("status {status}")));
        }

        let parsed: TavilyResponse = response.json().await.map_err(request_failed)?;
        Ok(parsed.results.into_iter().map(SearchHit::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_search_is_empty() {
        let search = TavilySearch::new(None);
        assert!(!search.is_configured());
        assert!(search.search("acme backend", 5).await.unwrap().is_empty());
    }

    #[test]
    fn tavily_result_maps_to_hit() {
        let parsed: TavilyResponse = serde_json::from_str(
            r#"{"results": [{"title": "Acme", "content": "hiring", "url": "https://x", "score": 0.8}, {"title": "B"}]}"#,
        )
        .unwrap();
        let hits: Vec<SearchHit> = parsed.results.into_iter().map(SearchHit::from).collect();
        assert_eq!(hits[0].snippet, "hiring");
        assert_eq!(hits[0].relevance, 0.8);
        assert_eq!(hits[1].relevance, 0.0);
        assert!(hits[1].url.is_empty());
    }
}
