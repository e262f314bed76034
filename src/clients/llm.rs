//! OpenAI-compatible chat completions client (vLLM, Runpod serverless).
//!
//! Answers are coerced into JSON: strict mode asks the server for a JSON
//! object, and prose around the object is stripped before parsing.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::clients::{LanguageModel, LlmRequest, Prompt, http_client};
use crate::config::LlmConfig;
use crate::error::LlmError;

const PROVIDER: &str = "vllm";
const SYSTEM_PROMPT: &str = "You are a helpful analyst.";
const RUNPOD_MARKER: &str = "api.runpod.ai/v2/";
/// Linear backoff step: attempt `n` waits `n` steps.
const RETRY_STEP: Duration = Duration::from_millis(1500);

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

struct Endpoint {
    chat_url: String,
    api_key: SecretString,
}

/// Client for `/v1/chat/completions` on an OpenAI-compatible server.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    endpoint: Option<Endpoint>,
    model: String,
    max_retries: u32,
    retry_step: Duration,
}

impl OpenAiCompatClient {
    /// Build from configuration. Without a base URL every call returns `None`.
    pub fn from_config(config: &LlmConfig) -> Self {
        let http = http_client(reqwest::Client::builder().timeout(config.timeout), "llm");
        let endpoint = config.base_url.as_deref().map(|base| {
            let (api_base, api_key) =
                resolve_endpoint(base, &config.api_key, config.runpod_api_key.as_ref());
            Endpoint {
                chat_url: format!("{api_base}/chat/completions"),
                api_key,
            }
        });
        Self {
            http,
            endpoint,
            model: config.model.clone(),
            max_retries: config.max_retries,
            retry_step: RETRY_STEP,
        }
    }

    /// Shorten the backoff step.
    pub fn with_retry_step(mut self, step: Duration) -> Self {
        self.retry_step = step;
        self
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }

    fn build_body(&self, request: &LlmRequest) -> Value {
        let messages = match &request.prompt {
            Prompt::Text(text) => json!([
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": wrap_prompt(text, request.strict_json)},
            ]),
            Prompt::Messages(messages) => Value::Array(messages.clone()),
        };

        let mut body = serde_json::Map::new();
        body.insert(
            "model".into(),
            Value::String(request.model.clone().unwrap_or_else(|| self.model.clone())),
        );
        body.insert("messages".into(), messages);
        if request.strict_json {
            body.insert("response_format".into(), json!({"type": "json_object"}));
        }
        if let Some(temperature) = request.temperature {
            body.insert("temperature".into(), json!(temperature));
        }
        for (key, value) in &request.extra_body {
            body.insert(key.clone(), value.clone());
        }
        Value::Object(body)
    }

    async fn complete_once(&self, endpoint: &Endpoint, body: &Value) -> Result<String, LlmError> {
        let response = self
            .http
            .post(&endpoint.chat_url)
            .bearer_auth(endpoint.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.into(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(LlmError::RateLimited {
                provider: PROVIDER.into(),
                retry_after,
            });
        }
        if !status.is_success() {
            return Err(LlmError::Status {
                provider: PROVIDER.into(),
                status: status.as_u16(),
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.into(),
            reason: e.to_string(),
        })?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatClient {
    async fn generate_json(&self, request: LlmRequest) -> Option<Value> {
        let Some(endpoint) = &self.endpoint else {
            debug!("LLM endpoint not configured; skipping call");
            return None;
        };
        let body = self.build_body(&request);

        for attempt in 0..=self.max_retries {
            let err = match self.complete_once(endpoint, &body).await {
                Ok(content) => match extract_json(&content) {
                    Some(value) => return Some(value),
                    None if !request.strict_json => return None,
                    None => LlmError::InvalidResponse {
                        provider: PROVIDER.into(),
                        reason: "response was not valid JSON".into(),
                    },
                },
                Err(e) => e,
            };

            if !err.is_retryable() {
                warn!(error = %err, "LLM request failed");
                return None;
            }
            if attempt == self.max_retries {
                warn!(error = %err, attempts = attempt + 1, "LLM retries exhausted");
                return None;
            }
            debug!(error = %err, attempt = attempt + 1, "Retrying LLM request");
            tokio::time::sleep(self.retry_step * (attempt + 1)).await;
        }
        None
    }
}

fn wrap_prompt(prompt: &str, strict_json: bool) -> String {
    if strict_json {
        format!("Return JSON only.\n{prompt}")
    } else {
        prompt.to_string()
    }
}

/// API root and key for a configured base URL.
///
/// Runpod serverless endpoints expose the OpenAI API under `/openai/v1` and
/// take the Runpod key when one is set.
fn resolve_endpoint(
    base_url: &str,
    api_key: &SecretString,
    runpod_api_key: Option<&SecretString>,
) -> (String, SecretString) {
    let base = base_url.trim_end_matches('/');
    if base.contains(RUNPOD_MARKER) {
        let key = runpod_api_key.unwrap_or(api_key).clone();
        (format!("{base}/openai/v1"), key)
    } else {
        (format!("{base}/v1"), api_key.clone())
    }
}

/// Parse model output as JSON, falling back to the outermost `{...}` span.
pub fn extract_json(content: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(content) {
        return Some(value);
    }
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&content[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;

    fn config(base_url: Option<String>) -> LlmConfig {
        LlmConfig {
            base_url,
            model: "test-model".into(),
            api_key: SecretString::from("EMPTY"),
            runpod_api_key: None,
            timeout: Duration::from_secs(5),
            max_retries: 2,
        }
    }

    #[test]
    fn extract_json_variants() {
        assert_eq!(extract_json(r#"{"a": 1}"#), Some(json!({"a": 1})));
        assert_eq!(
            extract_json("Sure! Here it is:\n{\"a\": {\"b\": 2}}\nThanks"),
            Some(json!({"a": {"b": 2}}))
        );
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("} backwards {"), None);
    }

    #[test]
    fn endpoint_resolution() {
        let key = SecretString::from("k");
        let runpod = SecretString::from("rp");

        let (url, _) = resolve_endpoint("http://vllm:8000/", &key, None);
        assert_eq!(url, "http://vllm:8000/v1");

        let (url, api_key) =
            resolve_endpoint("https://api.runpod.ai/v2/abc123", &key, Some(&runpod));
        assert_eq!(url, "https://api.runpod.ai/v2/abc123/openai/v1");
        assert_eq!(api_key.expose_secret(), "rp");
    }

    #[test]
    fn body_shape() {
        let client = OpenAiCompatClient::from_config(&config(Some("http://x".into())));
        let body = client.build_body(
            &LlmRequest::text("describe")
                .temperature(0.2)
                .extra("wait_for_ready", json!(true)),
        );
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][1]["content"], "Return JSON only.\ndescribe");
        assert_eq!(body["wait_for_ready"], true);

        let relaxed = client.build_body(
            &LlmRequest::messages(vec![json!({"role": "user", "content": "hi"})])
                .strict_json(false)
                .model(Some("other".into())),
        );
        assert_eq!(relaxed["model"], "other");
        assert!(relaxed.get("response_format").is_none());
        assert_eq!(relaxed["messages"][0]["content"], "hi");
    }

    #[tokio::test]
    async fn unconfigured_client_returns_none() {
        let client = OpenAiCompatClient::from_config(&config(None));
        assert!(!client.is_configured());
        assert!(client.generate_json(LlmRequest::text("x")).await.is_none());
    }

    async fn flaky_server(failures: usize, hits: Arc<AtomicUsize>) -> String {
        async fn handler(
            State((failures, hits)): State<(usize, Arc<AtomicUsize>)>,
        ) -> (StatusCode, String) {
            let n = hits.fetch_add(1, Ordering::SeqCst);
            if n < failures {
                return (StatusCode::SERVICE_UNAVAILABLE, "busy".into());
            }
            let body = json!({
                "choices": [{"message": {"content": "{\"ok\": true}"}}]
            });
            (StatusCode::OK, body.to_string())
        }

        let app = Router::new()
            .route("/v1/chat/completions", post(handler))
            .with_state((failures, hits));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn retries_server_errors_then_parses() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = flaky_server(2, hits.clone()).await;
        let client = OpenAiCompatClient::from_config(&config(Some(base)))
            .with_retry_step(Duration::from_millis(5));

        let value = client.generate_json(LlmRequest::text("x")).await;
        assert_eq!(value, Some(json!({"ok": true})));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = flaky_server(10, hits.clone()).await;
        let client = OpenAiCompatClient::from_config(&config(Some(base)))
            .with_retry_step(Duration::from_millis(5));

        assert!(client.generate_json(LlmRequest::text("x")).await.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
