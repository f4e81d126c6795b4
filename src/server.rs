use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::agent::http::HttpAgentDispatcher;
use crate::agent::{Dispatcher, RoutingDispatcher};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::ledger::Ledger;
use crate::run::machine::Resolution;
use crate::run::registry::RunRegistry;
use crate::workspace::WorkspaceCollaborator;

pub struct AppState {
    pub config: AppConfig,
    pub registry: RunRegistry,
    pub ledger: Arc<Ledger>,
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let ledger = Arc::new(Ledger::new(&config.ledger));
        let http = HttpAgentDispatcher::new(&config.agents);
        let workspace = WorkspaceCollaborator::new(&config.workspace);
        let inner = Arc::new(RoutingDispatcher::new(http, workspace));
        let dispatcher = Arc::new(Dispatcher::new(
            inner,
            Duration::from_secs(config.agents.invoke_timeout_secs),
        ));
        let registry = RunRegistry::new(Duration::from_secs(config.agents.cancel_grace_secs));

        Self {
            config,
            registry,
            ledger,
            dispatcher,
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/runs", post(start_run))
        .route("/runs/:id", get(run_status))
        .route("/runs/:id/ledger", get(run_ledger))
        .route("/runs/:id/resume", post(resume_run))
        .route("/runs/:id/abort", post(abort_run))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct StartRequest {
    task: String,
}

#[derive(Serialize)]
struct StartResponse {
    run_id: String,
}

async fn start_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartResponse>, AppError> {
    let run_id = state
        .registry
        .start(
            &request.task,
            Arc::clone(&state.dispatcher),
            Arc::clone(&state.ledger),
        )
        .await;
    Ok(Json(StartResponse { run_id }))
}

async fn run_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let snapshot = state.registry.snapshot(&id).await?;
    Ok(Json(snapshot).into_response())
}

async fn run_ledger(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let entries = state.ledger.read_all(&id).await?;
    Ok(Json(entries).into_response())
}

async fn resume_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(resolution): Json<Resolution>,
) -> Result<StatusCode, AppError> {
    state.registry.resume(&id, resolution).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn abort_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.registry.abort(&id).await?;
    Ok(StatusCode::ACCEPTED)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::RunNotFound(_) => StatusCode::NOT_FOUND,
            AppError::NotBlocked(_) => StatusCode::CONFLICT,
            AppError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
