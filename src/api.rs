//! HTTP surface for Docquery.
//!
//! This module exposes a compact Axum router with a handful of endpoints:
//!
//! - `POST /api/v1/run` – Download a PDF, index it, and answer the submitted questions.
//!   Optionally guarded by a static bearer token.
//! - `GET /` – Liveness probe.
//! - `GET /health` – Per-component health of the resource registry.
//! - `GET /ready` – Registry readiness and lifecycle state.
//! - `GET /performance` – Aggregate request statistics from the trace buffer.
//!
//! Error kinds map onto status codes: timeouts become 504, external-service failures 502,
//! document-processing failures 422 (client input), and vector-store or registry failures
//! 503.

use crate::errors::QueryError;
use crate::pipeline::QueryPipeline;
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Shared state behind the router.
pub struct ApiState {
    pipeline: Arc<QueryPipeline>,
    api_token: Option<String>,
}

/// Build the HTTP router exposing the question-answering API surface.
pub fn create_router(pipeline: Arc<QueryPipeline>, api_token: Option<String>) -> Router {
    Router::new()
        .route("/api/v1/run", post(run_submission))
        .route("/", get(read_root))
        .route("/health", get(get_health))
        .route("/ready", get(get_ready))
        .route("/performance", get(get_performance))
        .with_state(Arc::new(ApiState {
            pipeline,
            api_token,
        }))
}

/// Request body for the `POST /api/v1/run` endpoint.
#[derive(Deserialize)]
struct RunRequest {
    /// URL of the PDF document to process.
    documents: String,
    /// Natural-language questions about the document.
    questions: Vec<String>,
}

/// Success response for the `POST /api/v1/run` endpoint.
#[derive(Serialize)]
struct RunResponse {
    /// One answer per submitted question, in order.
    answers: Vec<String>,
}

/// Process a document and answer the submitted questions.
async fn run_submission(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    authorize(&state, &headers)?;
    let answers = state
        .pipeline
        .process_request(&request.documents, &request.questions)
        .await?;
    Ok(Json(RunResponse { answers }))
}

/// Liveness probe.
async fn read_root() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": "Docquery question-answering service is running."
    }))
}

/// Per-component registry health.
async fn get_health(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let health = state.pipeline.registry().health_check().await;
    Json(serde_json::to_value(health).unwrap_or_else(|_| json!({"overall_status": "unhealthy"})))
}

/// Registry readiness and lifecycle state.
async fn get_ready(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let registry = state.pipeline.registry();
    Json(json!({
        "ready": registry.is_ready(),
        "state": registry.state(),
    }))
}

/// Aggregate performance statistics.
async fn get_performance(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let stats = state.pipeline.performance_stats();
    Json(serde_json::to_value(stats).unwrap_or_else(|_| json!({})))
}

fn authorize(state: &ApiState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.api_token.as_deref() else {
        return Ok(());
    };
    let supplied = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if supplied == format!("Bearer {expected}") {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

enum ApiError {
    Unauthorized,
    Query(QueryError),
}

impl From<QueryError> for ApiError {
    fn from(error: QueryError) -> Self {
        Self::Query(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "Invalid or missing API key".to_string(),
            )
                .into_response(),
            Self::Query(error) => {
                let status = match &error {
                    QueryError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    QueryError::ExternalService { .. } => StatusCode::BAD_GATEWAY,
                    QueryError::DocumentProcessing { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    QueryError::VectorStore { .. } | QueryError::ResourceInitialization { .. } => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                };
                (status, error.to_string()).into_response()
            }
        }
    }
}
