//! # API REST
//!
//! HTTP ingestion surface for LIS.
//!
//! Handles:
//! - HTTP endpoints with axum for the two ingestion entry points
//! - OpenAPI/Swagger documentation
//! - REST-specific concerns (JSON serialization, CORS, status mapping)
//!
//! Ingestion itself lives in `lis-core`; handlers run it on the blocking pool.

#![warn(rust_2018_idioms)]

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use lis_core::{IngestError, IngestionService, StoredResult};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

/// Application state shared across REST API handlers
#[derive(Clone)]
pub struct AppState {
    pub ingestion: IngestionService,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthRes {
    pub ok: bool,
    pub message: String,
}

/// Summary of one persisted record.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct IngestedRecord {
    pub id: String,
    /// `sample` or `analyzer`.
    pub kind: String,
    /// Sample number or barcode.
    pub key: String,
    pub assignment_state: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&StoredResult> for IngestedRecord {
    fn from(record: &StoredResult) -> Self {
        Self {
            id: record.id.to_string(),
            kind: record.key.kind.to_string(),
            key: record.key.value.clone(),
            assignment_state: record.assignment.state.to_string(),
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct IngestBatchRes {
    pub count: usize,
    pub results: Vec<IngestedRecord>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct IngestResultRes {
    /// False when the message carried no result value and was discarded.
    pub stored: bool,
    pub result: Option<IngestedRecord>,
}

#[derive(OpenApi)]
#[openapi(
    paths(health, ingest_batch, ingest_result),
    components(schemas(HealthRes, IngestedRecord, IngestBatchRes, IngestResultRes))
)]
pub struct ApiDoc;

/// Build the REST router with Swagger UI and permissive CORS.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ingest/batch", post(ingest_batch))
        .route("/ingest/result", post(ingest_result))
        .merge(
            SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_status(e: &IngestError) -> (StatusCode, &'static str) {
    match e {
        IngestError::InvalidInput(_) | IngestError::Decode(_) => {
            (StatusCode::BAD_REQUEST, "Invalid payload")
        }
        IngestError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error"),
    }
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint for the REST API
#[axum::debug_handler]
async fn health(State(_state): State<AppState>) -> Json<HealthRes> {
    Json(HealthRes {
        ok: true,
        message: "LIS REST API is alive".into(),
    })
}

#[utoipa::path(
    post,
    path = "/ingest/batch",
    request_body(content = String, content_type = "text/plain"),
    responses(
        (status = 200, description = "Samples persisted", body = IngestBatchRes),
        (status = 500, description = "Internal server error")
    )
)]
/// Ingest a batch-analyzer blob
///
/// The body is the raw pseudo-HL7 text of zero or more samples. Returns every persisted
/// sample in stream order.
///
/// # Errors
/// Returns `500 Internal Server Error` if persistence fails. Samples persisted before the
/// failure are kept.
#[axum::debug_handler]
async fn ingest_batch(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<IngestBatchRes>, (StatusCode, &'static str)> {
    let service = state.ingestion.clone();
    let outcome = tokio::task::spawn_blocking(move || service.ingest_batch(&body)).await;

    match outcome {
        Ok(Ok(saved)) => Ok(Json(IngestBatchRes {
            count: saved.len(),
            results: saved.iter().map(IngestedRecord::from).collect(),
        })),
        Ok(Err(e)) => {
            tracing::error!("Batch ingestion error: {:?}", e);
            Err(error_status(&e))
        }
        Err(e) => {
            tracing::error!("Batch ingestion task failed: {:?}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Internal error"))
        }
    }
}

#[utoipa::path(
    post,
    path = "/ingest/result",
    request_body(content = String, description = "Canonical JSON object or pseudo-HL7 text"),
    responses(
        (status = 200, description = "Result persisted or discarded", body = IngestResultRes),
        (status = 400, description = "Bad request"),
        (status = 500, description = "Internal server error")
    )
)]
/// Ingest one single-result analyzer message
///
/// # Errors
/// Returns `400 Bad Request` if the body is JSON that does not fit the canonical shape, and
/// `500 Internal Server Error` if persistence fails.
#[axum::debug_handler]
async fn ingest_result(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<IngestResultRes>, (StatusCode, &'static str)> {
    let service = state.ingestion.clone();
    let outcome = tokio::task::spawn_blocking(move || service.ingest_single(&body)).await;

    match outcome {
        Ok(Ok(saved)) => Ok(Json(IngestResultRes {
            stored: saved.is_some(),
            result: saved.as_ref().map(IngestedRecord::from),
        })),
        Ok(Err(e)) => {
            tracing::error!("Result ingestion error: {:?}", e);
            Err(error_status(&e))
        }
        Err(e) => {
            tracing::error!("Result ingestion task failed: {:?}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Internal error"))
        }
    }
}
