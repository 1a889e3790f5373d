//! HTTP surface: task CRUD, resume as SSE, pause, answer a tool call.
//!
//! Registry and runtime calls block on store I/O, so handlers run them on
//! the blocking pool. Plain store reads and writes are awaited directly.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

use crate::bridge::{TurnStream, sse_response};
use crate::error::{StoreError, TaskError};
use crate::message::Message;
use crate::registry::TaskRegistry;
use crate::store::{NewTask, TaskPage, TaskRecord, TaskStore};

/// Page size when a listing does not ask for one.
const LIST_PER_PAGE: u32 = 15;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TaskRegistry>,
    pub store: Arc<dyn TaskStore>,
}

/// Build the Axum router with the task routes.
pub fn task_routes(registry: Arc<TaskRegistry>, store: Arc<dyn TaskStore>) -> Router {
    let state = AppState { registry, store };

    Router::new()
        .route("/health", get(health))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", get(get_task).delete(delete_task))
        .route("/api/tasks/{id}/resume", post(resume_task))
        .route("/api/tasks/{id}/pause", post(pause_task))
        .route("/api/tasks/{id}/answer", post(answer_tool))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error response for a failed request.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        let status = match &e {
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            TaskError::Busy { .. } | TaskError::NoPendingTool { .. } => StatusCode::CONFLICT,
            TaskError::Client { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = if e.is_not_found() {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "Request failed");
        }
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}

/// Run blocking registry work off the async workers.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(ApiError::from)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

// ── Tasks ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListQuery {
    workspace_id: Option<i64>,
    #[serde(default = "first_page")]
    page: u32,
    #[serde(default = "list_per_page")]
    per_page: u32,
}

fn first_page() -> u32 {
    1
}

fn list_per_page() -> u32 {
    LIST_PER_PAGE
}

#[derive(Debug, Default, Deserialize)]
struct ResumeRequest {
    #[serde(default)]
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct AnswerRequest {
    tool_call_id: String,
    answer: String,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<TaskPage>, ApiError> {
    let workspace_id = query
        .workspace_id
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "workspace_id is required"))?;
    let page = state
        .store
        .list_tasks(workspace_id, query.page, query.per_page)
        .await?;
    Ok(Json(page))
}

async fn create_task(
    State(state): State<AppState>,
    Json(task): Json<NewTask>,
) -> Result<(StatusCode, Json<TaskRecord>), ApiError> {
    let record = state.store.create_task(&task).await?;
    debug!(task_id = record.id, workspace_id = record.workspace_id, "Task created");
    Ok((StatusCode::CREATED, Json(record)))
}

/// The stored task, with the live conversation when a runtime holds it.
async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<TaskRecord>, ApiError> {
    let mut record = state.store.fetch_task(id).await?;
    if let Some(runtime) = state.registry.get(id) {
        record.messages = runtime.messages();
    }
    Ok(Json(record))
}

/// Append the optional message and stream the run as SSE.
async fn resume_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: ResumeRequest = if body.is_empty() {
        ResumeRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("Invalid body: {e}")))?
    };

    let registry = Arc::clone(&state.registry);
    let stream: TurnStream =
        blocking(move || registry.add(id)?.run_with(request.message)).await?;

    debug!(task_id = id, "Streaming task run");
    Ok(sse_response(stream).into_response())
}

async fn pause_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let registry = Arc::clone(&state.registry);
    let stopped = blocking(move || registry.stop(id)).await?;
    Ok(if stopped {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}

async fn answer_tool(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<AnswerRequest>,
) -> Result<StatusCode, ApiError> {
    let registry = Arc::clone(&state.registry);
    blocking(move || {
        let runtime = registry.add(id)?;
        runtime.answer_tool(&request.tool_call_id, request.answer)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Stop and evict a live runtime, then delete the stored task.
async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let registry = Arc::clone(&state.registry);
    let evicted = blocking(move || Ok(registry.remove(id))).await?;
    state.store.delete_task(id).await?;
    debug!(task_id = id, evicted, "Task deleted");
    Ok(StatusCode::NO_CONTENT)
}
