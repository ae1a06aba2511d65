//! HTTP monitoring surface - read-only queries over the shared store
//!
//! Served by the server process on localhost, sharing the orchestrator's
//! component bundle. Three idempotent queries: recent executions (metadata
//! only, no log bodies), one execution with lazily-read log bodies, and a
//! health summary. A fourth endpoint is the thin transport adapter for the
//! named operations, streaming chunks as newline-delimited JSON.
//!
//! All endpoints return JSON and are designed for local consumption only.
//! Security: binds to 127.0.0.1 by default (localhost only).

use crate::error::BrainError;
use crate::ops::{self, Chunk, OpRequest};
use crate::orchestrator::Orchestrator;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

/// Build the monitoring router around the shared orchestrator.
pub fn router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/executions", get(list_executions))
        .route("/api/executions/:id", get(get_execution))
        .route("/api/op", post(run_op))
        .with_state(orchestrator)
}

/// Error wrapper mapping the taxonomy onto HTTP statuses.
struct ApiError(BrainError);

impl From<BrainError> for ApiError {
    fn from(e: BrainError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BrainError::NotFound(_) => StatusCode::NOT_FOUND,
            BrainError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            BrainError::Resource(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(status = %status, error = %self.0, "monitor request failed");
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Single health summary: counts, uptime, size.
async fn health(State(orchestrator): State<Orchestrator>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(orchestrator.status(None, None)?))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    session_id: Option<Uuid>,
    limit: Option<usize>,
}

/// Recent executions, metadata and code preview only - no log bodies.
async fn list_executions(
    State(orchestrator): State<Orchestrator>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let executions = orchestrator
        .components()
        .executions
        .list_recent(params.session_id, params.limit.unwrap_or(50).min(500))?;
    Ok(Json(json!({ "executions": executions })))
}

#[derive(Debug, Serialize)]
struct ExecutionDetail {
    #[serde(flatten)]
    status: crate::executions::ExecutionStatus,
    stdout: String,
    stderr: String,
}

/// One execution with its log bodies, read lazily from disk.
async fn get_execution(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let executions = &orchestrator.components().executions;
    let status = executions.get_status(id)?;
    let output = executions.get_output(id)?;
    Ok(Json(ExecutionDetail {
        status,
        stdout: output.stdout,
        stderr: output.stderr,
    }))
}

/// Transport adapter: run a named operation, streaming each chunk as one
/// newline-delimited JSON object. The HTTP status is always 200; operation
/// failures arrive as the terminal error chunk (never as a transport-level
/// error).
async fn run_op(
    State(orchestrator): State<Orchestrator>,
    Json(request): Json<OpRequest>,
) -> impl IntoResponse {
    let (tx, rx) = tokio::sync::mpsc::channel::<Chunk>(64);
    tokio::spawn(async move {
        ops::dispatch(&orchestrator, request, tx).await;
    });

    let stream = ReceiverStream::new(rx).map(|chunk| {
        let line = match &chunk {
            Chunk::Progress(text) => json!({ "progress": text }),
            Chunk::Final(doc) => json!({ "final": doc }),
            Chunk::Error(_) => json!({ "error": chunk.render() }),
        };
        Ok::<_, std::convert::Infallible>(format!("{line}\n"))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::Components;
    use crate::store::Store;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt as _;

    fn test_router() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("brain.db")).unwrap();
        let components =
            Components::build(store, 300, 24, dir.path().join("executions")).unwrap();
        let orchestrator = Orchestrator::new(components);
        orchestrator
            .components()
            .executions
            .queue("echo hi", None, None)
            .unwrap();
        (dir, router(orchestrator))
    }

    async fn get_json(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let (_dir, router) = test_router();
        let (status, body) = get_json(&router, "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["system"]["executions"]["queued"], 1);
    }

    #[tokio::test]
    async fn executions_list_has_no_log_bodies() {
        let (_dir, router) = test_router();
        let (status, body) = get_json(&router, "/api/executions?limit=10").await;
        assert_eq!(status, StatusCode::OK);
        let first = &body["executions"][0];
        assert!(first["code_preview"].is_string());
        assert!(first.get("stdout").is_none());
    }

    #[tokio::test]
    async fn unknown_execution_is_404() {
        let (_dir, router) = test_router();
        let (status, _body) =
            get_json(&router, &format!("/api/executions/{}", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn op_endpoint_streams_ndjson_chunks() {
        let (_dir, router) = test_router();
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/op")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"op": "status"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let last_line = std::str::from_utf8(&bytes)
            .unwrap()
            .lines()
            .last()
            .unwrap()
            .to_string();
        let parsed: serde_json::Value = serde_json::from_str(&last_line).unwrap();
        assert!(parsed.get("final").is_some());
    }
}
