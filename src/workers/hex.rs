//! Developer profile ("hex") analysis.
//!
//! Collects profile metrics, scores them on six axes and optionally lets the
//! language model adjust the scores and write per-axis summaries.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::clients::{LanguageModel, LlmRequest, ProfileMetricsCollector};
use crate::error::WorkerError;
use crate::tasks::payload::{FetchMode, HexPayload};
use crate::worker::{Worker, WorkerContext};
use crate::workers::scoring::calculate_scores;

const AXES: [&str; 6] = [
    "collaboration",
    "communication",
    "technical",
    "documentation",
    "reliability",
    "preference",
];

const SYSTEM_PROMPT: &str = "\
You are an analyst who evaluates developer skills and collaboration style.

Input:
- capabilities: career, skills, projects and awards
- reviews: feedback from other users (text_reviews and badge_reviews counts)
- github_features: GitHub activity metrics
- scores_final: precomputed baseline scores (0-100)

Produce scores for six axes (collaboration, communication, technical,
documentation, reliability, preference = how much others want to work with
this person) and a summary per axis.

Output rules:
- Output exactly one valid JSON object and nothing else.
- Each axis may move at most 6 points from scores_final, and only when a
  review, badge review or capability supports it. Otherwise keep scores_final.
- Use only evidence present in the input.
- Every radar_chart value is an integer from 0 to 100.
- Each analysis_summary entry has two paragraphs separated by a blank line:
  first the GitHub activity with concrete metrics, then the user's history
  and reviews. Write the summaries in Korean.";

fn schema_hint() -> Value {
    json!({
        "message": "analysis_completed",
        "data": {
            "radar_chart": AXES.iter().map(|a| (a.to_string(), json!(0))).collect::<serde_json::Map<_, _>>(),
            "confidence_level": "HIGH",
            "analysis_summary": AXES.iter().map(|a| (a.to_string(), json!("string"))).collect::<serde_json::Map<_, _>>(),
        }
    })
}

/// Worker for `hex` tasks.
pub struct HexWorker {
    ctx: WorkerContext,
    github: Arc<dyn ProfileMetricsCollector>,
    mock_metrics: Arc<dyn ProfileMetricsCollector>,
    llm: Arc<dyn LanguageModel>,
}

impl HexWorker {
    pub fn new(
        ctx: WorkerContext,
        github: Arc<dyn ProfileMetricsCollector>,
        mock_metrics: Arc<dyn ProfileMetricsCollector>,
        llm: Arc<dyn LanguageModel>,
    ) -> Self {
        Self {
            ctx,
            github,
            mock_metrics,
            llm,
        }
    }

    async fn analyze(&self) -> Result<Value, WorkerError> {
        let payload: HexPayload = self.ctx.decode_payload()?;
        payload
            .validate()
            .map_err(|e| WorkerError::InvalidInput(e.to_string()))?;

        self.ctx.update_progress("collecting_github").await?;
        let collector = match payload.options.github_fetch_mode {
            FetchMode::Live => &self.github,
            FetchMode::Mock => &self.mock_metrics,
        };
        let features = collector
            .collect_features(&payload.github_username, payload.options.analysis_window_days)
            .await?;

        self.ctx.update_progress("calculating_scores").await?;
        let scores = calculate_scores(&features);

        let mut radar_chart =
            serde_json::to_value(scores).map_err(|e| WorkerError::Failed(e.to_string()))?;
        let mut confidence_level = json!("MEDIUM");
        let mut analysis_summary: Value = AXES
            .iter()
            .map(|a| (a.to_string(), json!("")))
            .collect::<serde_json::Map<_, _>>()
            .into();

        if payload.options.use_llm {
            self.ctx.update_progress("calling_llm").await?;
            let input = json!({
                "user_id": payload.user_id,
                "github_username": payload.github_username,
                "capabilities": payload.capabilities,
                "reviews": payload.reviews,
                "github_features": features,
                "scores_final": scores,
            });
            let request =
                LlmRequest::text(build_prompt(&input)).strict_json(payload.options.strict_json);

            if let Some(answer) = self.llm.generate_json(request).await {
                let data = answer.get("data").unwrap_or(&answer);
                if let Some(v) = data.get("radar_chart") {
                    radar_chart = v.clone();
                }
                if let Some(v) = data.get("confidence_level") {
                    confidence_level = v.clone();
                }
                if let Some(v) = data.get("analysis_summary") {
                    analysis_summary = v.clone();
                }
            }
        }

        Ok(json!({
            "message": "analysis_completed",
            "data": {
                "radar_chart": radar_chart,
                "confidence_level": confidence_level,
                "analysis_summary": analysis_summary,
            }
        }))
    }
}

fn build_prompt(input: &Value) -> String {
    format!(
        "{SYSTEM_PROMPT}\n\nSchema (example values):\n{}\n\n\
         Analyze the input below and produce JSON matching the schema.\n\nInput:\n{input}",
        serde_json::to_string_pretty(&schema_hint()).unwrap_or_default(),
    )
}

#[async_trait]
impl Worker for HexWorker {
    async fn run(&mut self) -> Result<Value, WorkerError> {
        self.ctx.mark_running().await?;
        let outcome = self.analyze().await;
        self.ctx.settle(outcome).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ProfileFeatures, StaticMetricsCollector};
    use crate::error::CollectorError;
    use crate::store::{MemoryTaskStore, TaskStore};
    use crate::tasks::model::{TaskStatus, TaskType};
    use std::sync::Mutex;

    struct RateLimited;

    #[async_trait]
    impl ProfileMetricsCollector for RateLimited {
        async fn collect_features(
            &self,
            _username: &str,
            _window_days: u32,
        ) -> Result<ProfileFeatures, CollectorError> {
            Err(CollectorError::RateLimited {
                retry_after_seconds: 42,
                reset_at: None,
            })
        }
    }

    struct CannedModel {
        answer: Option<Value>,
        prompts: Mutex<Vec<LlmRequest>>,
    }

    #[async_trait]
    impl LanguageModel for CannedModel {
        async fn generate_json(&self, request: LlmRequest) -> Option<Value> {
            self.prompts.lock().unwrap().push(request);
            self.answer.clone()
        }
    }

    fn model(answer: Option<Value>) -> Arc<CannedModel> {
        Arc::new(CannedModel {
            answer,
            prompts: Mutex::new(Vec::new()),
        })
    }

    async fn worker(
        payload: Value,
        github: Arc<dyn ProfileMetricsCollector>,
        llm: Arc<dyn LanguageModel>,
    ) -> (HexWorker, Arc<MemoryTaskStore>) {
        let store = Arc::new(MemoryTaskStore::new());
        store.create("h1", TaskType::Hex, payload.clone()).await.unwrap();
        let ctx = WorkerContext::new("h1", TaskType::Hex, payload, store.clone());
        let mock = Arc::new(StaticMetricsCollector::default());
        (HexWorker::new(ctx, github, mock, llm), store)
    }

    #[tokio::test]
    async fn mock_mode_without_llm_uses_baseline_scores() {
        let llm = model(None);
        let (mut worker, store) = worker(
            json!({
                "user_id": 1,
                "github_username": "octocat",
                "options": {"use_llm": false, "github_fetch_mode": "mock"}
            }),
            Arc::new(RateLimited),
            llm.clone(),
        )
        .await;

        let result = worker.run().await.unwrap();
        let features = StaticMetricsCollector::default()
            .collect_features("octocat", 180)
            .await
            .unwrap();
        let expected = serde_json::to_value(calculate_scores(&features)).unwrap();
        assert_eq!(result["message"], "analysis_completed");
        assert_eq!(result["data"]["radar_chart"], expected);
        assert_eq!(result["data"]["confidence_level"], "MEDIUM");
        assert!(llm.prompts.lock().unwrap().is_empty());

        let record = store.get("h1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result, Some(result));
    }

    #[tokio::test]
    async fn llm_output_overrides_chart_and_summary() {
        let llm = model(Some(json!({
            "data": {
                "radar_chart": {"collaboration": 70},
                "confidence_level": "HIGH",
                "analysis_summary": {"collaboration": "solid reviewer"}
            }
        })));
        let (mut worker, _) = worker(
            json!({
                "user_id": 1,
                "github_username": "octocat",
                "options": {"github_fetch_mode": "mock", "strict_json": false}
            }),
            Arc::new(RateLimited),
            llm.clone(),
        )
        .await;

        let result = worker.run().await.unwrap();
        assert_eq!(result["data"]["radar_chart"]["collaboration"], 70);
        assert_eq!(result["data"]["confidence_level"], "HIGH");
        assert_eq!(
            result["data"]["analysis_summary"]["collaboration"],
            "solid reviewer"
        );

        let prompts = llm.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(!prompts[0].strict_json);
    }

    #[tokio::test]
    async fn rate_limit_marks_failed_with_retry_hint() {
        let (mut worker, store) = worker(
            json!({"user_id": 1, "github_username": "octocat"}),
            Arc::new(RateLimited),
            model(None),
        )
        .await;

        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, WorkerError::Collector(CollectorError::RateLimited { .. })));

        let record = store.get("h1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(
            record.error.as_deref(),
            Some("GitHub rate limit exceeded. Retry after 42 seconds.")
        );
        assert_eq!(record.progress.as_deref(), Some("collecting_github"));
    }

    #[tokio::test]
    async fn invalid_payload_fails_task() {
        let (mut worker, store) = worker(
            json!({"user_id": 1, "github_username": "  "}),
            Arc::new(StaticMetricsCollector::default()),
            model(None),
        )
        .await;

        assert!(worker.run().await.is_err());
        let record = store.get("h1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.unwrap().contains("github_username"));
    }
}
