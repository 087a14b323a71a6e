//! HTTP request surface.
//!
//! Exposes activation, readiness, the live interaction endpoint, session
//! summary, result submission, completion and revocation over axum, plus a
//! plain `GET /health`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::orchestrator::{CompletionMetadata, Orchestrator};
use crate::{AppError, Result};

/// Message shown for consumed or unknown links.
pub const LINK_USED_MESSAGE: &str = "This link has already been used.";

#[derive(Clone)]
struct HttpState {
    orchestrator: Arc<Orchestrator>,
    ready_wait: Duration,
}

/// Error wrapper mapping [`AppError`] onto HTTP responses.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl ApiError {
    /// Status code for the wrapped error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            AppError::SessionNotFound(_) | AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidInput(_) | AppError::InvalidTransition(_) => StatusCode::BAD_REQUEST,
            AppError::RegistryConflict(_) => StatusCode::CONFLICT,
            AppError::BundleUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::TrainingFailed(_)
            | AppError::LaunchFailed(_)
            | AppError::WorkerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ReadinessTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::WorkspaceCorrupt(_)
            | AppError::Config(_)
            | AppError::Db(_)
            | AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self.0 {
            AppError::SessionNotFound(_) => LINK_USED_MESSAGE.to_owned(),
            other => other.to_string(),
        };
        if status.is_server_error() {
            warn!(%status, error = %self.0, "request failed");
        }
        (
            status,
            Json(json!({
                "servable": false,
                "error": message,
                "retryable": self.0.is_retryable(),
            })),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct SubmitResultRequest {
    session_id: String,
    questionnaire_id: String,
    answers: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    session_id: String,
    questionnaire_id: String,
    #[serde(flatten)]
    metadata: CompletionMetadata,
}

/// Handler for `GET /health`: returns 200 OK with a plain-text body.
async fn health() -> &'static str {
    "ok"
}

async fn activate(
    State(state): State<HttpState>,
    Path(session_id): Path<String>,
) -> ApiResult<Response> {
    let outcome = state.orchestrator.activate(&session_id).await?;
    Ok(Json(outcome).into_response())
}

async fn ready(
    State(state): State<HttpState>,
    Path(session_id): Path<String>,
) -> ApiResult<Response> {
    let subscription = state.orchestrator.subscribe_readiness(&session_id).await?;
    match tokio::time::timeout(state.ready_wait, subscription.wait()).await {
        Ok(Some(event)) => Ok(Json(event).into_response()),
        Ok(None) => Err(AppError::SessionNotFound(session_id).into()),
        Err(_elapsed) => Err(AppError::ReadinessTimeout(format!(
            "no readiness event within {:?}",
            state.ready_wait
        ))
        .into()),
    }
}

async fn endpoint(
    State(state): State<HttpState>,
    Path(session_id): Path<String>,
) -> ApiResult<Response> {
    let endpoint = state.orchestrator.interaction_endpoint(&session_id).await?;
    Ok(Json(json!({ "endpoint": endpoint })).into_response())
}

async fn summary(
    State(state): State<HttpState>,
    Path(session_id): Path<String>,
) -> ApiResult<Response> {
    let summary = state.orchestrator.get_session_summary(&session_id).await?;
    Ok(Json(summary).into_response())
}

async fn revoke(
    State(state): State<HttpState>,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.orchestrator.revoke(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn submit_result(
    State(state): State<HttpState>,
    Json(request): Json<SubmitResultRequest>,
) -> ApiResult<Response> {
    let result_id = state
        .orchestrator
        .submit_result(&request.session_id, &request.questionnaire_id, request.answers)
        .await?;
    Ok(Json(json!({ "result_id": result_id })).into_response())
}

async fn complete(
    State(state): State<HttpState>,
    Json(request): Json<CompleteRequest>,
) -> ApiResult<Response> {
    let result_id = request.metadata.result_id.clone();
    let outcome = state
        .orchestrator
        .complete_questionnaire(&request.session_id, &request.questionnaire_id, request.metadata)
        .await?;
    Ok(Json(json!({
        "retired": outcome.retired,
        "archived": outcome.archived,
        "archive_error": outcome.archive_error,
        "result_id": result_id,
    }))
    .into_response())
}

/// Build the router.
///
/// `ready_wait` bounds how long `GET /interact/{id}/ready` blocks.
#[must_use]
pub fn router(orchestrator: Arc<Orchestrator>, ready_wait: Duration) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/interact/{session_id}", post(activate))
        .route("/interact/{session_id}/ready", get(ready))
        .route("/interact/{session_id}/endpoint", get(endpoint))
        .route("/active/{session_id}", get(summary).delete(revoke))
        .route("/submit-results", post(submit_result))
        .route("/complete", post(complete))
        .with_state(HttpState {
            orchestrator,
            ready_wait,
        })
}

/// Serve the router on `listener` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Io` if the server fails.
pub async fn serve(
    listener: TcpListener,
    orchestrator: Arc<Orchestrator>,
    ready_wait: Duration,
    ct: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "http server listening");
    }

    axum::serve(listener, router(orchestrator, ready_wait))
        .with_graceful_shutdown(async move {
            ct.cancelled().await;
            info!("http server shutting down");
        })
        .await
        .map_err(|err| AppError::Io(format!("http server error: {err}")))
}
