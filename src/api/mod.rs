//! HTTP interface under `/ai`: submit, poll status, fetch result.

pub mod schemas;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{Value, json};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, warn};

use crate::error::Error;
use crate::tasks::Producer;
use crate::tasks::model::{TaskStatus, TaskType};
use crate::tasks::payload::{HexPayload, JobPayload, OcrRequest, decode};

pub use schemas::{StatusResponse, SubmitResponse};

/// Shared state for the task routes.
#[derive(Clone)]
pub struct ApiState {
    pub producer: Producer,
}

fn detail(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

fn not_found() -> Response {
    detail(StatusCode::NOT_FOUND, json!({"detail": "Task not found"}))
}

fn invalid_request(reason: impl ToString) -> Response {
    detail(
        StatusCode::UNPROCESSABLE_ENTITY,
        json!({"message": "invalid_request", "detail": reason.to_string()}),
    )
}

fn internal(err: &Error) -> Response {
    error!(error = %err, "Task store unavailable");
    detail(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"message": "internal_error", "detail": err.to_string()}),
    )
}

fn to_value<T: Serialize>(payload: &T) -> Result<Value, Response> {
    serde_json::to_value(payload).map_err(invalid_request)
}

async fn submit(state: &ApiState, task_type: TaskType, payload: Value) -> Response {
    match state.producer.submit(task_type, payload, None).await {
        Ok(record) => (StatusCode::ACCEPTED, Json(SubmitResponse::from(&record))).into_response(),
        Err(Error::Transport(e)) => {
            warn!(task_type = %task_type, error = %e, "Submission not enqueued");
            detail(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"message": "task_queue_unavailable", "detail": e.to_string()}),
            )
        }
        Err(e) => internal(&e),
    }
}

/// POST /ai/hex/analyze
async fn submit_hex(
    State(state): State<ApiState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return invalid_request(rejection.body_text()),
    };
    let payload = match decode::<HexPayload>(&body).and_then(|p| p.validate().map(|_| p)) {
        Ok(payload) => payload,
        Err(e) => return invalid_request(e),
    };
    match to_value(&payload) {
        Ok(value) => submit(&state, TaskType::Hex, value).await,
        Err(response) => response,
    }
}

/// POST /ai/job/analyze
async fn submit_job(
    State(state): State<ApiState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return invalid_request(rejection.body_text()),
    };
    let payload = match decode::<JobPayload>(&body).and_then(|p| p.validate().map(|_| p)) {
        Ok(payload) => payload,
        Err(e) => return invalid_request(e),
    };
    match to_value(&payload) {
        Ok(value) => submit(&state, TaskType::Job, value).await,
        Err(response) => response,
    }
}

/// POST /ai/ocr/analyze
///
/// Accepts `image_data_url`, `image_base64` or `image_url` and stores the
/// resolved data URL.
async fn submit_ocr(
    State(state): State<ApiState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return invalid_request(rejection.body_text()),
    };
    let payload = match decode::<OcrRequest>(&body).and_then(OcrRequest::into_payload) {
        Ok(payload) => payload,
        Err(e) => return invalid_request(e),
    };
    match to_value(&payload) {
        Ok(value) => submit(&state, TaskType::Ocr, value).await,
        Err(response) => response,
    }
}

/// GET /ai/tasks/{task_id}
async fn get_status(State(state): State<ApiState>, Path(task_id): Path<String>) -> Response {
    match state.producer.status(&task_id).await {
        Ok(Some(record)) => Json(StatusResponse::from(record)).into_response(),
        Ok(None) => not_found(),
        Err(e) => internal(&e),
    }
}

/// GET /ai/tasks/{task_id}/result
///
/// Completed tasks answer with the stored result. Unfinished tasks answer
/// `202`, failed ones `500` with the recorded error.
async fn get_result(State(state): State<ApiState>, Path(task_id): Path<String>) -> Response {
    let record = match state.producer.status(&task_id).await {
        Ok(Some(record)) => record,
        Ok(None) => return not_found(),
        Err(e) => return internal(&e),
    };

    match record.status {
        TaskStatus::Pending => detail(
            StatusCode::ACCEPTED,
            json!({"message": "Task pending", "status": record.status}),
        ),
        TaskStatus::Running => detail(
            StatusCode::ACCEPTED,
            json!({
                "message": "Task running",
                "status": record.status,
                "progress": record.progress,
            }),
        ),
        TaskStatus::Failed => detail(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"message": "Task failed", "error": record.error}),
        ),
        TaskStatus::Completed => Json(record.result.unwrap_or_else(|| json!({}))).into_response(),
    }
}

/// GET /ai/health
async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// CORS layer for the configured origins. `*` allows any origin.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

/// Build the `/ai` routes.
pub fn task_routes(state: ApiState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/ai/hex/analyze", post(submit_hex))
        .route("/ai/job/analyze", post(submit_job))
        .route("/ai/ocr/analyze", post(submit_ocr))
        .route("/ai/tasks/{task_id}", get(get_status))
        .route("/ai/tasks/{task_id}/result", get(get_result))
        .route("/ai/health", get(health))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}
