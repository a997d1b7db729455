use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;

use super::engine::BoardHandle;
use super::models::{NewTask, Task};
use super::reconciler::{Liveness, UserAction};
use crate::errors::BoardError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub board: BoardHandle,
}

pub type SharedState = Arc<AppState>;

// ── Response payload types ────────────────────────────────────────────

#[derive(Serialize)]
pub struct RestartResponse {
    pub restarted: bool,
}

#[derive(Serialize)]
pub struct LivenessResponse {
    pub task_id: String,
    #[serde(flatten)]
    pub liveness: Liveness,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<BoardError> for ApiError {
    fn from(e: BoardError) -> Self {
        let message = e.to_string();
        match e {
            BoardError::TaskNotFound { .. } => ApiError::NotFound(message),
            BoardError::DuplicateTask { .. } => ApiError::Conflict(message),
            BoardError::InvalidAction { .. } => ApiError::Conflict(message),
            BoardError::EngineClosed => ApiError::Unavailable(message),
            BoardError::Other(_) => ApiError::Internal(message),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", get(get_task).delete(delete_task))
        .route("/api/tasks/{id}/actions", post(act_on_task))
        .route("/api/tasks/{id}/restart", post(restart_task))
        .route("/api/tasks/{id}/liveness", get(task_liveness))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_tasks(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let tasks = state.board.tasks().await?;
    let tasks: Vec<Task> = tasks.iter().map(|t| (**t).clone()).collect();
    Ok(Json(tasks))
}

async fn create_task(
    State(state): State<SharedState>,
    Json(req): Json<NewTask>,
) -> Result<impl IntoResponse, ApiError> {
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".into()));
    }
    let task = state.board.create_task(req).await?;
    Ok((StatusCode::CREATED, Json((*task).clone())))
}

async fn get_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.board.task(&id).await? {
        Some(task) => Ok(Json((*task).clone())),
        None => Err(ApiError::NotFound(format!("Task {} not found", id))),
    }
}

async fn delete_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.board.act(&id, UserAction::Delete).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn act_on_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(action): Json<UserAction>,
) -> Result<Response, ApiError> {
    match state.board.act(&id, action).await? {
        Some(task) => Ok(Json((*task).clone()).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn restart_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let restarted = state.board.restart(&id).await?;
    Ok(Json(RestartResponse { restarted }))
}

async fn task_liveness(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let liveness = state.board.liveness(&id).await?;
    Ok(Json(LivenessResponse {
        task_id: id,
        liveness,
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────
