//! Integration tests for the HTTP task API.
//!
//! Each test spins up an Axum server on a random port with in-process
//! backends and an embedded consumer, then drives it over real HTTP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use ai_tasks::api::{ApiState, task_routes};
use ai_tasks::app::Backends;
use ai_tasks::clients::{
    LanguageModel, LlmRequest, ProfileFeatures, ProfileMetricsCollector, StaticMetricsCollector,
    TavilySearch,
};
use ai_tasks::error::CollectorError;
use ai_tasks::store::MemoryTaskStore;
use ai_tasks::transport::MemoryTransport;
use ai_tasks::worker::{Consumer, ConsumerConfig};
use ai_tasks::workers::{WorkerDeps, default_registry};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

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
            reset_at: Some(0),
        })
    }
}

/// Answers every request with the same business card.
struct CardReader;

#[async_trait]
impl LanguageModel for CardReader {
    async fn generate_json(&self, _request: LlmRequest) -> Option<Value> {
        Some(json!({
            "is_business_card": true,
            "name": "Choi",
            "email": "choi@example.com",
            "mobile_phone": "01055556666",
            "company_phone": "0215881234"
        }))
    }
}

struct Server {
    base: String,
    consumer: Arc<Consumer>,
    consumer_handle: JoinHandle<()>,
    client: reqwest::Client,
}

impl Server {
    async fn start() -> Self {
        let backends = Backends::new(
            Arc::new(MemoryTaskStore::new()),
            Arc::new(MemoryTransport::new()),
        );
        let deps = WorkerDeps {
            github: Arc::new(RateLimited),
            mock_metrics: Arc::new(StaticMetricsCollector::default()),
            search: Arc::new(TavilySearch::new(None)),
            llm: Arc::new(CardReader),
        };
        let consumer = Arc::new(Consumer::new(
            backends.transport.clone(),
            backends.store.clone(),
            Arc::new(default_registry(deps)),
            ConsumerConfig {
                block: Duration::from_millis(20),
                ..ConsumerConfig::default()
            },
            &[],
        ));
        let consumer_handle = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run().await })
        };

        let app = task_routes(
            ApiState {
                producer: backends.producer(),
            },
            &["*".to_string()],
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            consumer,
            consumer_handle,
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let response = self
            .client
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let response = self
            .client
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    /// Poll the status endpoint until the task is terminal.
    async fn wait_terminal(&self, task_id: &str) -> Value {
        timeout(TEST_TIMEOUT, async {
            loop {
                let (_, body) = self.get(&format!("/ai/tasks/{task_id}")).await;
                if body["status"] == "completed" || body["status"] == "failed" {
                    return body;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("task did not finish in time")
    }

    async fn stop(self) {
        self.consumer.stop();
        timeout(TEST_TIMEOUT, self.consumer_handle)
            .await
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn ocr_submission_runs_to_completion() {
    let server = Server::start().await;

    let (status, body) = server
        .post("/ai/ocr/analyze", json!({"image_base64": "QUJD", "temperature": 0.0}))
        .await;
    assert_eq!(status, 202);
    assert_eq!(body["status"], "pending");
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let done = server.wait_terminal(&task_id).await;
    assert_eq!(done["status"], "completed");
    assert_eq!(done["progress"], "done");
    assert!(done.get("error").is_none());
    assert!(done["started_at"].is_string());
    assert!(done["completed_at"].is_string());

    let (status, result) = server.get(&format!("/ai/tasks/{task_id}/result")).await;
    assert_eq!(status, 200);
    assert_eq!(result["result"]["name"], "Choi");
    assert_eq!(result["result"]["mobile_phone"], "010-5555-6666");
    assert_eq!(result["result"]["company_phone"], "02-1588-1234");
    assert!(result["timing"]["infer_ms"].is_number());

    server.stop().await;
}

#[tokio::test]
async fn job_submission_completes_without_search() {
    let server = Server::start().await;

    let (status, body) = server
        .post(
            "/ai/job/analyze",
            json!({
                "user_id": 5,
                "name": "Kim",
                "company": "Acme",
                "department": "Platform",
                "position": "SRE",
                "options": {"enable_llm": false}
            }),
        )
        .await;
    assert_eq!(status, 202);
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let done = server.wait_terminal(&task_id).await;
    assert_eq!(done["status"], "completed");
    let (status, result) = server.get(&format!("/ai/tasks/{task_id}/result")).await;
    assert_eq!(status, 200);
    assert_eq!(result["message"], "ok");
    assert_eq!(result["data"]["search_confidence"], 0.0);

    server.stop().await;
}

#[tokio::test]
async fn rate_limited_hex_result_is_server_error() {
    let server = Server::start().await;

    let (status, body) = server
        .post("/ai/hex/analyze", json!({"user_id": 1, "github_username": "octocat"}))
        .await;
    assert_eq!(status, 202);
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let done = server.wait_terminal(&task_id).await;
    assert_eq!(done["status"], "failed");
    assert_eq!(done["progress"], "collecting_github");

    let (status, body) = server.get(&format!("/ai/tasks/{task_id}/result")).await;
    assert_eq!(status, 500);
    assert_eq!(
        body,
        json!({
            "message": "Task failed",
            "error": "GitHub rate limit exceeded. Retry after 42 seconds."
        })
    );

    server.stop().await;
}

#[tokio::test]
async fn invalid_submission_is_rejected() {
    let server = Server::start().await;

    let (status, body) = server
        .post(
            "/ai/ocr/analyze",
            json!({"image_url": "https://example.com/card.png", "temperature": 3.0}),
        )
        .await;
    assert_eq!(status, 422);
    assert_eq!(body["message"], "invalid_request");
    assert!(body["detail"].as_str().unwrap().contains("temperature"));

    let (status, _) = server
        .post("/ai/hex/analyze", json!({"user_id": 1, "github_username": ""}))
        .await;
    assert_eq!(status, 422);

    server.stop().await;
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let server = Server::start().await;

    let (status, body) = server.get("/ai/tasks/does-not-exist").await;
    assert_eq!(status, 404);
    assert_eq!(body, json!({"detail": "Task not found"}));

    let (status, body) = server.get("/ai/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");

    server.stop().await;
}
