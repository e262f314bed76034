//! GitHub profile metrics over the public REST API.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::clients::{ProfileFeatures, ProfileMetricsCollector, http_client};
use crate::error::CollectorError;

const GITHUB_API_BASE: &str = "https://api.github.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
/// Repositories inspected for language and README coverage.
const SAMPLE_REPOS: usize = 30;
const PAGE_SIZE: usize = 100;
/// Retry-after used when the reset header is missing or unreadable.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
struct Repo {
    name: Option<String>,
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchTotal {
    #[serde(default)]
    total_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Event {
    #[serde(rename = "type")]
    kind: Option<String>,
    created_at: Option<String>,
}

/// Event-derived activity metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Activity {
    pub commit_events: u64,
    pub recent_activity_days: Option<i64>,
    pub activity_stddev: Option<f64>,
}

/// Live collector backed by the GitHub REST API.
pub struct GitHubCollector {
    client: reqwest::Client,
    token: Option<SecretString>,
    base_url: String,
}

impl GitHubCollector {
    pub fn new(token: Option<SecretString>) -> Self {
        let client = http_client(
            reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .user_agent(concat!("ai-tasks/", env!("CARGO_PKG_VERSION"))),
            "github",
        );
        Self {
            client,
            token,
            base_url: GITHUB_API_BASE.to_string(),
        }
    }

    /// Point the collector at another API root.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn request(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, CollectorError> {
        let mut request = self
            .client
            .get(format!("{}{path}", self.base_url))
            .header("Accept", "application/vnd.github+json")
            .query(query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| CollectorError::Http(e.to_string()))?;

        if response.status() == StatusCode::FORBIDDEN {
            let header = |name: &str| {
                response
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            if let Some(err) = rate_limit_error(
                header("x-ratelimit-remaining").as_deref(),
                header("x-ratelimit-reset").as_deref(),
                Utc::now().timestamp(),
            ) {
                return Err(err);
            }
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, CollectorError> {
        let response = self.request(path, query).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CollectorError::Http(format!("GET {path} returned {status}")));
        }
        response
            .json()
            .await
            .map_err(|e| CollectorError::Http(format!("GET {path}: {e}")))
    }

    async fn list_repos(&self, username: &str) -> Result<Vec<Repo>, CollectorError> {
        let mut repos = Vec::new();
        let mut page = 1u32;
        loop {
            let batch: Vec<Repo> = self
                .get_json(
                    &format!("/users/{username}/repos"),
                    &[
                        ("per_page", PAGE_SIZE.to_string()),
                        ("page", page.to_string()),
                        ("sort", "updated".to_string()),
                    ],
                )
                .await?;
            let len = batch.len();
            repos.extend(batch);
            if len < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(repos)
    }

    async fn has_readme(&self, username: &str, repo: &str) -> Result<bool, CollectorError> {
        let response = self
            .request(&format!("/repos/{username}/{repo}/readme"), &[])
            .await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(CollectorError::Http(format!(
                "README lookup for {username}/{repo} returned {s}"
            ))),
        }
    }

    async fn search_total(&self, query: String) -> Result<u64, CollectorError> {
        let total: SearchTotal = self
            .get_json(
                "/search/issues",
                &[("q", query), ("per_page", "1".to_string())],
            )
            .await?;
        Ok(total.total_count)
    }
}

#[async_trait]
impl ProfileMetricsCollector for GitHubCollector {
    async fn collect_features(
        &self,
        username: &str,
        window_days: u32,
    ) -> Result<ProfileFeatures, CollectorError> {
        let now = Utc::now();
        let window_start = now - chrono::Duration::days(i64::from(window_days));
        let since = window_start.date_naive().format("%Y-%m-%d").to_string();

        let repos = self.list_repos(username).await?;
        let sample = &repos[..repos.len().min(SAMPLE_REPOS)];

        let mut languages = HashSet::new();
        let mut readme_hits = 0u64;
        for repo in sample {
            if let Some(language) = &repo.language {
                languages.insert(language.clone());
            }
            if let Some(name) = &repo.name
                && self.has_readme(username, name).await?
            {
                readme_hits += 1;
            }
        }

        let prs_opened = self
            .search_total(format!("author:{username} type:pr created:>={since}"))
            .await?;
        let prs_merged = self
            .search_total(format!("author:{username} type:pr is:merged created:>={since}"))
            .await?;
        let reviews = self
            .search_total(format!("reviewed-by:{username} type:pr created:>={since}"))
            .await?;
        let comments = self
            .search_total(format!("commenter:{username} type:issue created:>={since}"))
            .await?;

        let events: Vec<Event> = self
            .get_json(
                &format!("/users/{username}/events"),
                &[("per_page", PAGE_SIZE.to_string())],
            )
            .await?;
        let activity = activity_from_events(&events, window_start, now);

        tracing::debug!(username, repos = repos.len(), "Collected GitHub features");
        Ok(ProfileFeatures {
            repo_count: repos.len() as u64,
            pull_requests_opened: prs_opened,
            pull_requests_merged: prs_merged,
            pr_reviews_submitted: reviews,
            issue_comments_written: comments,
            language_diversity: languages.len() as u64,
            readme_coverage: percent(readme_hits, sample.len() as u64),
            merge_rate: percent(prs_merged, prs_opened),
            commit_events: activity.commit_events,
            recent_activity_days: activity.recent_activity_days,
            activity_stddev: activity.activity_stddev,
        })
    }
}

fn percent(part: u64, whole: u64) -> u64 {
    if whole == 0 {
        return 0;
    }
    (part as f64 / whole as f64 * 100.0).round_ties_even() as u64
}

/// Classify a 403 response. `None` when it is not a rate limit.
pub(crate) fn rate_limit_error(
    remaining: Option<&str>,
    reset: Option<&str>,
    now_secs: i64,
) -> Option<CollectorError> {
    if remaining != Some("0") {
        return None;
    }
    let reset_at = reset.and_then(|r| r.trim().parse::<i64>().ok());
    let retry_after_seconds = match reset_at {
        Some(at) => (at - now_secs).max(1) as u64,
        None => DEFAULT_RETRY_AFTER_SECS,
    };
    Some(CollectorError::RateLimited {
        retry_after_seconds,
        reset_at,
    })
}

/// Push count, days since the latest event, and spread of daily activity
/// inside the window.
pub(crate) fn activity_from_events(
    events: &[Event],
    window_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Activity {
    let mut per_day: HashMap<chrono::NaiveDate, u64> = HashMap::new();
    let mut latest: Option<DateTime<Utc>> = None;
    let mut commit_events = 0u64;

    for event in events {
        let Some(at) = event
            .created_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
        else {
            continue;
        };
        if latest.is_none_or(|l| at > l) {
            latest = Some(at);
        }
        if at < window_start {
            continue;
        }
        *per_day.entry(at.date_naive()).or_default() += 1;
        if event.kind.as_deref() == Some("PushEvent") {
            commit_events += 1;
        }
    }

    let activity_stddev = (!per_day.is_empty()).then(|| {
        let counts: Vec<f64> = per_day.values().map(|&c| c as f64).collect();
        let mean = counts.iter().sum::<f64>() / counts.len() as f64;
        let variance = counts.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / counts.len() as f64;
        (variance.sqrt() * 100.0).round_ties_even() / 100.0
    });

    Activity {
        commit_events,
        recent_activity_days: latest.map(|l| (now - l).num_days()),
        activity_stddev,
    }
}

/// Fixed metrics for mock fetch mode.
#[derive(Debug, Clone)]
pub struct StaticMetricsCollector {
    features: ProfileFeatures,
}

impl StaticMetricsCollector {
    pub fn new(features: ProfileFeatures) -> Self {
        Self { features }
    }

    /// Load a JSON feature bag from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CollectorError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CollectorError::Mock(format!("{}: {e}", path.display())))?;
        let features = serde_json::from_str(&raw)
            .map_err(|e| CollectorError::Mock(format!("{}: {e}", path.display())))?;
        Ok(Self { features })
    }
}

impl Default for StaticMetricsCollector {
    fn default() -> Self {
        Self::new(ProfileFeatures {
            repo_count: 18,
            pull_requests_opened: 42,
            pull_requests_merged: 35,
            pr_reviews_submitted: 27,
            issue_comments_written: 64,
            language_diversity: 4,
            readme_coverage: 72,
            merge_rate: 83,
            commit_events: 31,
            recent_activity_days: Some(3),
            activity_stddev: Some(1.42),
        })
    }
}

#[async_trait]
impl ProfileMetricsCollector for StaticMetricsCollector {
    async fn collect_features(
        &self,
        _username: &str,
        _window_days: u32,
    ) -> Result<ProfileFeatures, CollectorError> {
        Ok(self.features.clone())
    }
}
