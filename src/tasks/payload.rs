//! Typed payload shapes for each task type.
//!
//! The core moves payloads around as opaque JSON. Each worker decodes the
//! shape it owns with [`decode`], and the HTTP layer validates the same
//! shapes before anything is stored.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskError;

/// Decode an opaque payload into a worker's typed shape.
pub fn decode<T: DeserializeOwned>(payload: &Value) -> Result<T, TaskError> {
    serde_json::from_value(payload.clone()).map_err(|e| TaskError::InvalidPayload(e.to_string()))
}

fn default_true() -> bool {
    true
}

// ── Hex ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HexPayload {
    pub user_id: i64,
    pub github_username: String,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub reviews: ReviewsBlock,
    #[serde(default)]
    pub options: HexOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub career: Vec<CareerItem>,
    pub skills: Vec<String>,
    pub projects: Vec<CapabilityProject>,
    pub achievements: Vec<AchievementItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CareerItem {
    pub company_name: String,
    pub department: Option<String>,
    pub position: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityProject {
    pub project_name: String,
    pub description: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AchievementItem {
    pub title: String,
    pub grade: Option<String>,
    pub organization: Option<String>,
    pub description: Option<String>,
    pub award_date: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewsBlock {
    pub text_reviews: Vec<String>,
    pub badge_reviews: BadgeReviews,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BadgeReviews {
    pub collaboration: Option<i64>,
    pub communication: Option<i64>,
    pub technical: Option<i64>,
    pub documentation: Option<i64>,
    pub reliability: Option<i64>,
    pub preference: Option<i64>,
}

/// Where profile metrics come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    #[default]
    Live,
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HexOptions {
    #[serde(default = "default_true")]
    pub use_llm: bool,
    #[serde(default)]
    pub github_fetch_mode: FetchMode,
    #[serde(default = "default_true")]
    pub strict_json: bool,
    #[serde(default = "default_window_days")]
    pub analysis_window_days: u32,
}

fn default_window_days() -> u32 {
    180
}

impl Default for HexOptions {
    fn default() -> Self {
        Self {
            use_llm: true,
            github_fetch_mode: FetchMode::Live,
            strict_json: true,
            analysis_window_days: default_window_days(),
        }
    }
}

impl HexPayload {
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.github_username.trim().is_empty() {
            return Err(TaskError::InvalidPayload(
                "github_username must not be empty".into(),
            ));
        }
        if self.options.analysis_window_days < 1 {
            return Err(TaskError::InvalidPayload(
                "options.analysis_window_days must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

// ── Job ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub user_id: i64,
    pub name: String,
    pub company: String,
    pub department: String,
    pub position: String,
    #[serde(default)]
    pub projects: Vec<ProjectItem>,
    #[serde(default)]
    pub awards: Vec<AwardItem>,
    #[serde(default)]
    pub options: JobOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectItem {
    pub name: String,
    pub content: Option<String>,
    pub period_months: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwardItem {
    pub name: String,
    pub year: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default = "default_true")]
    pub enable_llm: bool,
    #[serde(default = "default_language")]
    pub output_language: String,
    #[serde(default = "default_true")]
    pub strict_json: bool,
}

fn default_language() -> String {
    "ko".to_string()
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            enable_llm: true,
            output_language: default_language(),
            strict_json: true,
        }
    }
}

impl JobPayload {
    pub fn validate(&self) -> Result<(), TaskError> {
        for (field, value) in [
            ("name", &self.name),
            ("company", &self.company),
            ("department", &self.department),
            ("position", &self.position),
        ] {
            if value.trim().is_empty() {
                return Err(TaskError::InvalidPayload(format!(
                    "{field} must not be empty"
                )));
            }
        }
        Ok(())
    }
}

// ── OCR ─────────────────────────────────────────────────────────────

/// Worker-side OCR payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrPayload {
    pub image_data_url: Option<String>,
    /// Prebuilt chat messages. Built from the image when absent.
    pub messages: Option<Vec<Value>>,
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_true")]
    pub wait_for_ready: bool,
    #[serde(default)]
    pub return_raw: bool,
}

/// OCR submission as accepted over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrRequest {
    pub image_url: Option<String>,
    pub image_base64: Option<String>,
    pub image_data_url: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_true")]
    pub wait_for_ready: bool,
    #[serde(default)]
    pub return_raw: bool,
}

impl OcrRequest {
    /// Resolve the image reference into the payload the worker consumes.
    ///
    /// Preference order: data URL, then base64 (wrapped as JPEG data URL),
    /// then a plain URL.
    pub fn into_payload(self) -> Result<OcrPayload, TaskError> {
        let image = non_empty(self.image_data_url)
            .or_else(|| non_empty(self.image_base64).map(|b64| format!("data:image/jpeg;base64,{b64}")))
            .or_else(|| non_empty(self.image_url))
            .ok_or_else(|| {
                TaskError::InvalidPayload(
                    "one of image_data_url, image_base64 or image_url is required".into(),
                )
            })?;

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(TaskError::InvalidPayload(
                "temperature must be between 0 and 2".into(),
            ));
        }

        Ok(OcrPayload {
            image_data_url: Some(image),
            messages: None,
            model: self.model,
            temperature: self.temperature,
            wait_for_ready: self.wait_for_ready,
            return_raw: self.return_raw,
        })
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty())
}
