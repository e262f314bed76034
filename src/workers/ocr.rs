//! Business card OCR through a vision language model.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::clients::{LanguageModel, LlmRequest, extract_json};
use crate::error::WorkerError;
use crate::tasks::payload::OcrPayload;
use crate::worker::{Worker, WorkerContext};

const SYSTEM_TEXT: &str = "\
You are a careful document understanding system.
You must follow instructions strictly.
If any exclusion condition applies, you must classify the image as NOT a business card.
Output format rules are mandatory and must never be violated.";

const USER_TEXT: &str = r#"You are a document understanding system that analyzes images
containing text and layouts to determine their document type
and extract structured information when appropriate.

First, determine whether the input image is a business card.

[Conditions for a Business Card]
- The image contains personal or company contact information.
- A personal name (individual person's name) MUST be present.
- At least TWO of the following are likely to appear together:
  - Email address
  - Mobile phone number
  - Company phone number
  - Company name or job title
- The information is concisely organized in a small, card-like layout.
- The text appears to be PRINTED text, not handwritten.
- The image visually resembles a professionally produced business card.

[Cases That Are NOT Business Cards]
- Flyers, posters, notices, official announcements, or advertisements
- Receipts, contracts, reports, invoices, or general document pages
- Product photos, menus, or website/app screenshots
- Images that contain little or no contact information
- Images whose primary purpose is NOT personal or professional identification
- Memo-like or draft-style content rather than a formal card
- Any handwritten content, including:
  - Handwritten names, phone numbers, or emails
  - Contact information written directly on paper as a note
  - Sketch-like layouts drawn with a pen or pencil

If the image meets ANY of the conditions above,
you MUST classify it as NOT a business card.

[Decision Rule]
Evaluate the image holistically using BOTH textual information
and visual characteristics.

[Output Format]
Always output a single JSON object.

If the image is NOT a business card, output:
{"is_business_card": false, "confidence": 0.0}

If the image IS a business card, output:
{"is_business_card": true, "name": "", "email": "", "company_phone": "", "mobile_phone": ""}

[Strict Output Rules]
- Output JSON ONLY.
- Do NOT include markdown, comments, or extra text."#;

/// Worker for `ocr` tasks.
pub struct OcrWorker {
    ctx: WorkerContext,
    llm: Arc<dyn LanguageModel>,
}

impl OcrWorker {
    pub fn new(ctx: WorkerContext, llm: Arc<dyn LanguageModel>) -> Self {
        Self { ctx, llm }
    }

    async fn analyze(&self) -> Result<Value, WorkerError> {
        self.ctx.update_progress("validating_input").await?;
        let payload: OcrPayload = self.ctx.decode_payload()?;
        let image_data_url = payload
            .image_data_url
            .filter(|url| !url.is_empty())
            .ok_or_else(|| WorkerError::InvalidInput("image_data_url is required".into()))?;

        self.ctx.update_progress("building_messages").await?;
        let messages = match payload.messages {
            Some(messages) if !messages.is_empty() => messages,
            _ => build_messages(&image_data_url),
        };

        let total_start = Instant::now();
        self.ctx.update_progress("calling_ocr").await?;
        let infer_start = Instant::now();
        let request = LlmRequest::messages(messages)
            .strict_json(true)
            .model(payload.model)
            .temperature(payload.temperature)
            .extra("wait_for_ready", json!(payload.wait_for_ready));
        let raw = self
            .llm
            .generate_json(request)
            .await
            .ok_or(WorkerError::NoModelResponse)?;
        let infer_ms = infer_start.elapsed().as_secs_f64() * 1000.0;
        let total_ms = total_start.elapsed().as_secs_f64() * 1000.0;

        self.ctx.update_progress("postprocessing").await?;
        let result = if payload.return_raw {
            raw
        } else {
            postprocess(&raw).unwrap_or(raw)
        };

        Ok(json!({
            "result": result,
            "timing": {
                "infer_ms": infer_ms,
                "total_ms": total_ms,
            }
        }))
    }
}

#[async_trait]
impl Worker for OcrWorker {
    async fn run(&mut self) -> Result<Value, WorkerError> {
        self.ctx.mark_running().await?;
        let outcome = self.analyze().await;
        self.ctx.settle(outcome).await
    }
}

/// System and user messages asking the model to classify and read a card.
pub fn build_messages(image_data_url: &str) -> Vec<Value> {
    vec![
        json!({
            "role": "system",
            "content": [{"type": "text", "text": SYSTEM_TEXT}],
        }),
        json!({
            "role": "user",
            "content": [
                {"type": "image_url", "image_url": {"url": image_data_url}},
                {"type": "text", "text": USER_TEXT},
            ],
        }),
    ]
}

/// Normalize a Korean phone number to its dashed form.
///
/// Mobile numbers become `010-XXXX-XXXX`; Seoul numbers become
/// `02-XXX-XXXX` or `02-XXXX-XXXX`. A `+82` country prefix is folded into
/// the leading zero. Anything else normalizes to an empty string.
pub fn normalize_korean_phone(input: &str) -> String {
    let mut digits: String = input.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return String::new();
    }
    if let Some(rest) = digits.strip_prefix("82") {
        digits = if rest.starts_with('0') {
            rest.to_string()
        } else {
            format!("0{rest}")
        };
    }

    if digits.starts_with("010") && digits.len() >= 11 {
        return format!("{}-{}-{}", &digits[..3], &digits[3..7], &digits[7..11]);
    }
    if digits.starts_with("02") && digits.len() >= 9 {
        if digits.len() == 9 {
            return format!("{}-{}-{}", &digits[..2], &digits[2..5], &digits[5..]);
        }
        return format!("{}-{}-{}", &digits[..2], &digits[2..6], &digits[6..10]);
    }
    String::new()
}

/// Normalize phone fields of a model answer.
///
/// Accepts either the parsed card object or a raw chat completion body with
/// `choices`. The company number is dropped when it duplicates the mobile
/// number or is itself a mobile number. Returns `None` when the answer
/// cannot be read as an object.
pub fn postprocess(raw: &Value) -> Option<Value> {
    let mut card: Map<String, Value> = if raw.get("choices").is_some() {
        let content = raw
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())?;
        match extract_json(content)? {
            Value::Object(map) => map,
            _ => return None,
        }
    } else {
        raw.as_object()?.clone()
    };

    let phone = |key: &str| {
        card.get(key)
            .and_then(Value::as_str)
            .map(normalize_korean_phone)
            .unwrap_or_default()
    };
    let mobile = phone("mobile_phone");
    let mut company = phone("company_phone");
    if company == mobile || (company.starts_with("010") && !mobile.is_empty()) {
        company.clear();
    }
    card.insert("mobile_phone".into(), Value::String(mobile));
    card.insert("company_phone".into(), Value::String(company));
    Some(Value::Object(card))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryTaskStore, TaskStore};
    use crate::tasks::model::{TaskStatus, TaskType};
    use std::sync::Mutex;

    struct Canned {
        answer: Option<Value>,
        seen: Mutex<Option<LlmRequest>>,
    }

    #[async_trait]
    impl LanguageModel for Canned {
        async fn generate_json(&self, request: LlmRequest) -> Option<Value> {
            *self.seen.lock().unwrap() = Some(request);
            self.answer.clone()
        }
    }

    fn canned(answer: Option<Value>) -> Arc<Canned> {
        Arc::new(Canned {
            answer,
            seen: Mutex::new(None),
        })
    }

    async fn run(payload: Value, llm: Arc<Canned>) -> (Result<Value, WorkerError>, Arc<MemoryTaskStore>) {
        let store = Arc::new(MemoryTaskStore::new());
        store.create("o1", TaskType::Ocr, payload.clone()).await.unwrap();
        let ctx = WorkerContext::new("o1", TaskType::Ocr, payload, store.clone());
        let result = OcrWorker::new(ctx, llm).run().await;
        (result, store)
    }

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_korean_phone("010 1234 5678"), "010-1234-5678");
        assert_eq!(normalize_korean_phone("+82 10-1234-5678"), "010-1234-5678");
        assert_eq!(normalize_korean_phone("02-123-4567"), "02-123-4567");
        assert_eq!(normalize_korean_phone("(02) 1234 5678"), "02-1234-5678");
        assert_eq!(normalize_korean_phone("031-123-4567"), "");
        assert_eq!(normalize_korean_phone("no digits"), "");
        assert_eq!(normalize_korean_phone(""), "");
    }

    #[test]
    fn postprocess_drops_duplicate_company_phone() {
        let card = postprocess(&json!({
            "is_business_card": true,
            "name": "Kim",
            "mobile_phone": "01012345678",
            "company_phone": "010.1234.5678"
        }))
        .unwrap();
        assert_eq!(card["mobile_phone"], "010-1234-5678");
        assert_eq!(card["company_phone"], "");
        assert_eq!(card["name"], "Kim");

        let office = postprocess(&json!({
            "mobile_phone": "",
            "company_phone": "02 555 1234"
        }))
        .unwrap();
        assert_eq!(office["company_phone"], "02-555-1234");
    }

    #[test]
    fn postprocess_unwraps_choices() {
        let raw = json!({
            "choices": [{"message": {"content": "{\"name\": \"Lee\", \"mobile_phone\": \"010-9999-8888\"}"}}]
        });
        let card = postprocess(&raw).unwrap();
        assert_eq!(card["name"], "Lee");
        assert_eq!(card["mobile_phone"], "010-9999-8888");

        assert!(postprocess(&json!({"choices": [{"message": {"content": ""}}]})).is_none());
        assert!(postprocess(&json!([1, 2])).is_none());
    }

    #[tokio::test]
    async fn missing_image_fails_task() {
        let (result, store) = run(json!({"temperature": 0.0}), canned(None)).await;
        assert!(matches!(result, Err(WorkerError::InvalidInput(_))));

        let record = store.get("o1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("image_data_url is required"));
        assert_eq!(record.progress.as_deref(), Some("validating_input"));
    }

    #[tokio::test]
    async fn no_model_response_fails_task() {
        let (result, store) = run(
            json!({"image_data_url": "data:image/png;base64,AAAA"}),
            canned(None),
        )
        .await;
        assert!(matches!(result, Err(WorkerError::NoModelResponse)));
        let record = store.get("o1").await.unwrap().unwrap();
        assert_eq!(
            record.error.as_deref(),
            Some("language model returned no response")
        );
    }

    #[tokio::test]
    async fn completes_with_postprocessed_card() {
        let llm = canned(Some(json!({
            "is_business_card": true,
            "name": "Park",
            "mobile_phone": "+82 10 2222 3333",
            "company_phone": "02-777-8888"
        })));
        let (result, store) = run(
            json!({
                "image_data_url": "data:image/png;base64,AAAA",
                "model": "vision-model",
                "temperature": 0.1,
                "wait_for_ready": false
            }),
            llm.clone(),
        )
        .await;

        let value = result.unwrap();
        assert_eq!(value["result"]["mobile_phone"], "010-2222-3333");
        assert_eq!(value["result"]["company_phone"], "02-777-8888");
        assert!(value["timing"]["infer_ms"].as_f64().unwrap() >= 0.0);
        assert!(value["timing"]["total_ms"].as_f64().is_some());

        let seen = llm.seen.lock().unwrap().clone().unwrap();
        assert!(seen.strict_json);
        assert_eq!(seen.model.as_deref(), Some("vision-model"));
        assert_eq!(seen.temperature, Some(0.1));
        assert_eq!(seen.extra_body["wait_for_ready"], false);

        let record = store.get("o1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn return_raw_keeps_model_answer() {
        let answer = json!({"mobile_phone": "01011112222", "company_phone": "01011112222"});
        let (result, _) = run(
            json!({"image_data_url": "data:x", "return_raw": true}),
            canned(Some(answer.clone())),
        )
        .await;
        assert_eq!(result.unwrap()["result"], answer);
    }
}
