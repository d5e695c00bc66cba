//! HTTP API Layer
//!
//! Thin axum surface over the pipeline orchestrator. Pipeline failures always
//! come back as a structured result with `status: failed`; a bare error
//! status is reserved for infrastructure faults.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::pipeline::{DetectionRequest, Orchestrator, PipelineResult};
use crate::storage::Database;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub db: Option<Arc<Database>>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    active_displays: usize,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

/// JSON upload body, accepted as an alternative to a raw image body
#[derive(Debug, Deserialize)]
struct UploadRequest {
    image_base64: String,
}

/// Create the HTTP router with all API routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/detect/capture", post(capture_handler))
        .route("/api/v1/detect/upload", post(upload_handler))
        .route("/api/v1/results/:id", get(get_result_handler))
        .with_state(state)
}

/// Bind and serve. A bind failure propagates so the process exits non-zero.
pub async fn serve(addr: SocketAddr, router: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!("listening on http://{}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_displays: state.orchestrator.display_pool().active_displays(),
    })
}

/// Trigger a live capture of a virtual display
async fn capture_handler(State(state): State<AppState>) -> Response {
    run_pipeline(&state, DetectionRequest::LiveCapture).await
}

/// Submit image bytes for detection. Accepts either a raw image body or JSON
/// `{ "image_base64": ... }`.
async fn upload_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);

    let bytes = if is_json {
        let request: UploadRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => return bad_request(format!("invalid JSON body: {}", e)),
        };
        match base64::engine::general_purpose::STANDARD.decode(&request.image_base64) {
            Ok(bytes) => bytes,
            Err(e) => return bad_request(format!("invalid base64 image: {}", e)),
        }
    } else {
        body.to_vec()
    };

    if bytes.is_empty() {
        return bad_request("empty image body".to_string());
    }

    run_pipeline(&state, DetectionRequest::Upload(bytes)).await
}

/// Fetch a persisted result by id
async fn get_result_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    let Some(db) = &state.db else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "persistence is disabled".to_string(),
                code: "storage_disabled".to_string(),
            }),
        )
            .into_response();
    };

    let db = Arc::clone(db);
    let fetched = tokio::task::spawn_blocking(move || db.fetch(id)).await;

    match fetched {
        Ok(Ok(Some(result))) => Json(result).into_response(),
        Ok(Ok(None)) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no result with id {}", id),
                code: "not_found".to_string(),
            }),
        )
            .into_response(),
        Ok(Err(e)) => internal_error(e.to_string()),
        Err(e) => internal_error(e.to_string()),
    }
}

/// Run the pipeline in its own task so a client disconnect cannot drop it
/// mid-stage; the drop guard cancels the run instead, which still releases
/// the display lease.
async fn run_pipeline(state: &AppState, request: DetectionRequest) -> Response {
    let token = CancellationToken::new();
    let _guard = token.clone().drop_guard();

    let orchestrator = Arc::clone(&state.orchestrator);
    let run_token = token.child_token();
    let task = tokio::spawn(async move { orchestrator.run(request, run_token).await });

    match task.await {
        Ok(result) => pipeline_response(result),
        Err(e) => {
            error!("pipeline task failed: {}", e);
            internal_error("pipeline task failed".to_string())
        }
    }
}

fn pipeline_response(result: PipelineResult) -> Response {
    // Failed runs are still structured 200 responses; the status field is
    // the contract, not the HTTP code
    Json(result).into_response()
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message,
            code: "bad_request".to_string(),
        }),
    )
        .into_response()
}

fn internal_error(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: message,
            code: "internal_error".to_string(),
        }),
    )
        .into_response()
}
