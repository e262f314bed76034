//! Job introduction writer.
//!
//! Searches the web for the team a person works in, scores how much the
//! results can be trusted, and asks the language model for a short
//! self-introduction grounded in them.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::warn;

use crate::clients::{LanguageModel, LlmRequest, SearchHit, WebSearch};
use crate::error::WorkerError;
use crate::tasks::payload::JobPayload;
use crate::worker::{Worker, WorkerContext};

const MAX_RESULTS: usize = 5;
const SNIPPET_PROMPT_CHARS: usize = 300;
/// Korean posting vocabulary only; the English query terms do not count.
const HIRING_KEYWORDS: [&str; 4] = ["채용", "직무", "개발자", "엔지니어"];

/// Worker for `job` tasks.
pub struct JobWorker {
    ctx: WorkerContext,
    search: Arc<dyn WebSearch>,
    llm: Arc<dyn LanguageModel>,
}

impl JobWorker {
    pub fn new(ctx: WorkerContext, search: Arc<dyn WebSearch>, llm: Arc<dyn LanguageModel>) -> Self {
        Self { ctx, search, llm }
    }

    async fn analyze(&self) -> Result<Value, WorkerError> {
        let payload: JobPayload = self.ctx.decode_payload()?;
        payload
            .validate()
            .map_err(|e| WorkerError::InvalidInput(e.to_string()))?;

        self.ctx.update_progress("building_search_query").await?;
        let query = build_search_query(&payload);

        self.ctx.update_progress("searching_web").await?;
        let hits = match self.search.search(&query, MAX_RESULTS).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(task_id = %self.ctx.task_id(), error = %e, "Web search failed; continuing without results");
                Vec::new()
            }
        };

        self.ctx.update_progress("calculating_confidence").await?;
        let confidence = search_confidence(&hits, &payload.company, &payload.position);

        let mut introduction = String::new();
        if payload.options.enable_llm {
            self.ctx.update_progress("calling_llm").await?;
            let request = LlmRequest::text(build_prompt(&payload, &hits))
                .strict_json(payload.options.strict_json);
            if let Some(text) = self
                .llm
                .generate_json(request)
                .await
                .and_then(|answer| answer.get("introduction")?.as_str().map(str::to_string))
            {
                introduction = text;
            }
        }

        Ok(json!({
            "message": "ok",
            "data": {
                "introduction": introduction,
                "search_confidence": confidence,
            }
        }))
    }
}

#[async_trait]
impl Worker for JobWorker {
    async fn run(&mut self) -> Result<Value, WorkerError> {
        self.ctx.mark_running().await?;
        let outcome = self.analyze().await;
        self.ctx.settle(outcome).await
    }
}

/// `"<company> <department> hiring linkedin <first two project names>"`,
/// whitespace-collapsed.
pub fn build_search_query(payload: &JobPayload) -> String {
    let mut query = format!("{} {} hiring linkedin", payload.company, payload.department);
    for project in payload.projects.iter().take(2) {
        query.push(' ');
        query.push_str(&project.name);
    }
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Confidence in `0.0..=1.0` that the hits describe this team.
///
/// Each hit earns relevance from the provider score, mentions of the company
/// and position, hiring vocabulary and a substantial snippet, capped at 1.
/// More hits and higher mean relevance raise the confidence.
pub fn search_confidence(hits: &[SearchHit], company: &str, position: &str) -> f64 {
    if hits.is_empty() {
        return 0.0;
    }
    let company = company.to_lowercase();
    let position = position.to_lowercase();

    let total: f64 = hits
        .iter()
        .map(|hit| {
            let text = format!("{} {}", hit.title, hit.snippet).to_lowercase();
            let mut score = hit.relevance * 0.4;
            if text.contains(&company) {
                score += 0.3;
            }
            if text.contains(&position) {
                score += 0.3;
            }
            if HIRING_KEYWORDS.iter().any(|k| text.contains(k)) {
                score += 0.15;
            }
            if hit.snippet.chars().count() > 50 {
                score += 0.15;
            }
            score.min(1.0)
        })
        .sum();
    let mean = total / hits.len() as f64;
    let confidence = (hits.len() as f64 / 5.0 * 0.4 + mean * 0.6).min(1.0);
    (confidence * 100.0).round() / 100.0
}

fn language_name(code: &str) -> &str {
    match code {
        "ko" => "Korean",
        "en" => "English",
        "ja" => "Japanese",
        other => other,
    }
}

fn build_prompt(payload: &JobPayload, hits: &[SearchHit]) -> String {
    let search_context = if hits.is_empty() {
        "No search results.".to_string()
    } else {
        hits.iter()
            .enumerate()
            .map(|(i, hit)| {
                let snippet: String = hit.snippet.chars().take(SNIPPET_PROMPT_CHARS).collect();
                format!(
                    "[Result {}] (relevance: {})\nTitle: {}\nContent: {}\nURL: {}",
                    i + 1,
                    hit.relevance,
                    hit.title,
                    snippet,
                    hit.url
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    let projects = payload
        .projects
        .iter()
        .map(|p| {
            format!(
                "  - {}: {} ({} months)",
                p.name,
                p.content.as_deref().unwrap_or(""),
                p.period_months.unwrap_or(0)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You write short professional self-introductions.\n\n\
         Combine the person's details with the web search results into one natural paragraph:\n\
         1. a greeting with affiliation and name\n\
         2. the team's mission\n\
         3. the concrete work this person does\n\n\
         Output only this JSON: {{\"introduction\": \"...\"}}\n\
         Write the introduction in {language}. Use a natural spoken tone.\n\n\
         Person:\n\
         - Name: {name}\n\
         - Company: {company}\n\
         - Department: {department}\n\
         - Position: {position}\n\
         - Projects:\n{projects}\n\n\
         Web search results:\n{search_context}",
        language = language_name(&payload.options.output_language),
        name = payload.name,
        company = payload.company,
        department = payload.department,
        position = payload.position,
    )
}
