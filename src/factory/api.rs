use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use super::db::DbHandle;
use super::models::*;
use super::names::generate_project_name;
use super::queue::JobRunner;
use super::ws::{WsMessage, broadcast_message};
use crate::errors::FactoryError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub ws_tx: broadcast::Sender<String>,
    pub jobs: JobRunner,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

#[derive(Deserialize)]
pub struct PromptRequest {
    pub value: String,
}

#[derive(Serialize)]
pub struct CreateProjectResponse {
    pub project: Project,
    pub message: Message,
    pub job: Job,
}

#[derive(Serialize)]
pub struct CreateMessageResponse {
    pub message: Message,
    pub job: Job,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<FactoryError> for ApiError {
    fn from(err: FactoryError) -> Self {
        match err {
            FactoryError::ProjectNotFound { .. }
            | FactoryError::JobNotFound { .. }
            | FactoryError::FragmentNotFound { .. } => ApiError::NotFound(err.to_string()),
            FactoryError::JobNotRunning { .. } | FactoryError::BadRequest(_) => {
                ApiError::BadRequest(err.to_string())
            }
            FactoryError::Database(e) => ApiError::Internal(e.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/{id}", get(get_project))
        .route(
            "/api/projects/{id}/messages",
            get(list_messages).post(create_message),
        )
        .route("/api/fragments/{id}", get(get_fragment))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn validated(req: PromptRequest) -> Result<String, ApiError> {
    validate_prompt(&req.value).map_err(ApiError::BadRequest)?;
    Ok(req.value)
}

async fn require_project(state: &SharedState, id: &str) -> Result<Project, ApiError> {
    let lookup = id.to_string();
    state
        .db
        .call(move |db| db.get_project(&lookup))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| FactoryError::ProjectNotFound { id: id.to_string() }.into())
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_projects(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let projects = state
        .db
        .call(|db| db.list_projects())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(projects))
}

async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<PromptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let value = validated(req)?;
    let name = generate_project_name();
    let content = value.clone();
    let (project, message) = state
        .db
        .call(move |db| db.create_project_with_message(&name, &content))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    info!(project_id = %project.id, name = %project.name, "project created");

    broadcast_message(
        &state.ws_tx,
        &WsMessage::ProjectCreated {
            project: project.clone(),
        },
    );
    broadcast_message(
        &state.ws_tx,
        &WsMessage::MessageCreated {
            message: MessageWithFragment {
                message: message.clone(),
                fragment: None,
            },
        },
    );

    let job = state
        .jobs
        .enqueue(JobEvent {
            value,
            project_id: project.id.clone(),
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateProjectResponse {
            project,
            message,
            job,
        }),
    ))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = require_project(&state, &id).await?;
    Ok(Json(project))
}

async fn list_messages(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_project(&state, &id).await?;
    let messages = state
        .db
        .call(move |db| db.list_messages(&id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(messages))
}

async fn create_message(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<PromptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let value = validated(req)?;
    require_project(&state, &id).await?;

    let project_id = id.clone();
    let content = value.clone();
    let message = state
        .db
        .call(move |db| {
            db.create_message(&project_id, &content, MessageRole::User, MessageType::Result)
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::MessageCreated {
            message: MessageWithFragment {
                message: message.clone(),
                fragment: None,
            },
        },
    );

    let job = state
        .jobs
        .enqueue(JobEvent {
            value,
            project_id: id,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateMessageResponse { message, job }),
    ))
}

async fn get_fragment(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let fragment = state
        .db
        .call(move |db| db.get_fragment(&lookup))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    match fragment {
        Some(fragment) => Ok(Json(fragment)),
        None => Err(FactoryError::FragmentNotFound { id }.into()),
    }
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let job = state
        .db
        .call(move |db| db.get_job(&lookup))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    match job {
        Some(job) => Ok(Json(job)),
        None => Err(FactoryError::JobNotFound { id }.into()),
    }
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.jobs.cancel(&id).await?;
    Ok(Json(job))
}
