use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use super::api::{self, AppState};
use super::db::{DbHandle, FactoryDb};
use super::job::JobContext;
use super::queue::JobRunner;
use super::ws;
use crate::agent::llm::{ChatCompletionsModel, LanguageModel};
use crate::agent::sandbox::{DockerProvider, SandboxProvider};
use crate::config::AppConfig;

/// Configuration for the HTTP server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3141,
            db_path: PathBuf::from(".code-agent/app.db"),
            dev_mode: false,
        }
    }
}

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ws_tx = state.ws_tx.clone();

    api::api_router()
        .route(
            "/ws",
            get(move |ws_upgrade| ws::ws_handler_with_sender(ws_upgrade, ws_tx)),
        )
        .with_state(state)
}

/// Wire the store, sandbox provider and model into shared state.
pub fn build_state(
    db: DbHandle,
    provider: Arc<dyn SandboxProvider>,
    model: Arc<dyn LanguageModel>,
    config: &AppConfig,
) -> Arc<AppState> {
    let (ws_tx, _rx) = broadcast::channel::<String>(256);
    let jobs = JobRunner::new(JobContext {
        db: db.clone(),
        provider,
        model,
        sandbox: config.sandbox.clone(),
        agent: config.agent.clone(),
        events: Some(ws_tx.clone()),
    });
    Arc::new(AppState { db, ws_tx, jobs })
}

/// Open the database at `path`, creating its directory first.
pub fn open_database(path: &std::path::Path) -> Result<FactoryDb> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    FactoryDb::new(path).context("Failed to initialize database")
}

/// Start the server and run until Ctrl+C.
pub async fn start_server(config: ServerConfig, app_config: AppConfig) -> Result<()> {
    let db = DbHandle::new(open_database(&config.db_path)?);

    let provider = DockerProvider::connect(
        app_config.sandbox.clone(),
        app_config.server.public_host.clone(),
    )
    .context("Failed to connect to Docker")?;
    let model = ChatCompletionsModel::new(app_config.model.clone())
        .context("Failed to build model client")?;

    let state = build_state(db, Arc::new(provider), Arc::new(model), &app_config);
    let resumed = state
        .jobs
        .resume_pending()
        .await
        .context("Failed to resume unfinished jobs")?;
    if resumed > 0 {
        info!(count = resumed, "resumed unfinished jobs");
    }
    let jobs = state.jobs.clone();

    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, model = %app_config.model.model, "code-agent server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    jobs.shutdown().await;
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{MemoryProvider, MemorySandbox, ScriptedModel, text_response};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_router() -> Router {
        let db = DbHandle::new(FactoryDb::new_in_memory().unwrap());
        let state = build_state(
            db,
            Arc::new(MemoryProvider::new(Arc::new(MemorySandbox::new()))),
            Arc::new(ScriptedModel::repeating(text_response("..."))),
            &AppConfig::default(),
        );
        build_router(state)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let req = Request::builder()
            .uri("/api/projects")
            .body(Body::empty())
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let req = Request::builder()
            .uri("/some/client/route")
            .body(Body::empty())
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_open_database_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("app.db");
        open_database(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3141);
        assert_eq!(config.db_path, PathBuf::from(".code-agent/app.db"));
        assert!(!config.dev_mode);
    }
}
