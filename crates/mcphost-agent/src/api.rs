use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use mcphost_process::{LogEntry, ServerStatus};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ErrorPayload, HostError},
    host_manager::{HostManager, UploadReceipt, UploadRequest},
    server_config::UploadConfig,
};

const DEFAULT_STATUS_LOG_LINES: usize = 50;
const DEFAULT_LOG_LIMIT: usize = 200;

impl HostError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            HostError::NotFound(_) => StatusCode::NOT_FOUND,
            HostError::ServerRunning(_)
            | HostError::ServerLimitReached { .. }
            | HostError::RestartLimitReached { .. } => StatusCode::CONFLICT,
            HostError::ArchiveTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            HostError::UnsupportedArchive(_)
            | HostError::InvalidArchive(_)
            | HostError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            HostError::LanguageNotAllowed { .. } | HostError::SecurityScanFailed { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            HostError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HostError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(ErrorPayload::from(&self))).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<HostManager>,
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    servers: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        servers: state.manager.server_count().await,
    })
}

#[derive(Debug, Deserialize)]
pub struct UploadBody {
    pub name: String,
    pub filename: String,
    pub archive_base64: String,
    #[serde(default)]
    pub config: UploadConfig,
    #[serde(default)]
    pub uploaded_by: Option<String>,
}

async fn upload(
    State(state): State<AppState>,
    Json(body): Json<UploadBody>,
) -> Result<(StatusCode, Json<UploadReceipt>), HostError> {
    let archive = base64::engine::general_purpose::STANDARD
        .decode(body.archive_base64.trim())
        .map_err(|e| HostError::InvalidArchive(format!("archive_base64 is not valid base64: {e}")))?;
    let receipt = state
        .manager
        .upload(UploadRequest {
            name: body.name,
            filename: body.filename,
            archive,
            config: body.config,
            uploaded_by: body
                .uploaded_by
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "anonymous".to_string()),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn list(State(state): State<AppState>) -> Json<Vec<ServerStatus>> {
    Json(state.manager.list().await)
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    log_lines: Option<usize>,
}

async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<StatusQuery>,
) -> Result<Json<ServerStatus>, HostError> {
    let n = q.log_lines.unwrap_or(DEFAULT_STATUS_LOG_LINES);
    Ok(Json(state.manager.get_status(&id, n).await?))
}

#[derive(Debug, Serialize)]
struct ActionResponse {
    ok: bool,
    status: ServerStatus,
}

async fn action_response(state: &AppState, id: &str, ok: bool) -> Result<Json<ActionResponse>, HostError> {
    let status = state.manager.get_status(id, DEFAULT_STATUS_LOG_LINES).await?;
    Ok(Json(ActionResponse { ok, status }))
}

async fn start(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, HostError> {
    let ok = state.manager.start(&id).await?;
    action_response(&state, &id, ok).await
}

async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, HostError> {
    state.manager.stop(&id).await?;
    action_response(&state, &id, true).await
}

async fn restart(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, HostError> {
    let ok = state.manager.restart(&id).await?;
    action_response(&state, &id, ok).await
}

async fn reset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, HostError> {
    state.manager.reset(&id).await?;
    action_response(&state, &id, true).await
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    force: bool,
}

async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<DeleteQuery>,
) -> Result<StatusCode, HostError> {
    state.manager.delete(&id, q.force).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LogsQuery>,
) -> Result<Json<Vec<LogEntry>>, HostError> {
    let limit = q.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    Ok(Json(state.manager.get_logs(&id, limit).await?))
}

pub fn router(manager: Arc<HostManager>) -> Router {
    // base64 inflates by 4/3; leave room for the JSON envelope.
    let body_limit = usize::try_from(manager.settings().max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_mul(4)
        / 3
        + 64 * 1024;

    Router::new()
        .route("/healthz", get(healthz))
        .route("/servers", get(list).post(upload))
        .route("/servers/:id", get(status).delete(delete))
        .route("/servers/:id/start", post(start))
        .route("/servers/:id/stop", post(stop))
        .route("/servers/:id/restart", post(restart))
        .route("/servers/:id/reset", post(reset))
        .route("/servers/:id/logs", get(logs))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(AppState { manager })
}
