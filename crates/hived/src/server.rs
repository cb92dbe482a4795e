//! HTTP control plane for hived.
//!
//! Local-only JSON API used by `hivectl` and by agents.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use hive_core::workflow::WorkflowError;
use hive_core::{Event, Id, Run, Step, Story, WorkflowSpec};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::engine::{Claim, ClaimedStep, Engine, EngineError};
use crate::storage::{Storage, StorageError};

/// Shared state for HTTP handlers.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub storage: Arc<Storage>,
    /// Directory holding `{workflow}/workflow.yml`.
    pub workflows_dir: PathBuf,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("workflows_dir", &self.workflows_dir)
            .finish_non_exhaustive()
    }
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/steps", get(list_steps))
        .route("/runs/{id}/stories", get(list_stories))
        .route("/runs/{id}/events", get(list_events))
        .route("/steps/claim", post(claim_step))
        .route("/steps/peek", get(peek_step))
        .route("/steps/{id}/complete", post(complete_step))
        .route("/steps/{id}/fail", post(fail_step))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `127.0.0.1:{port}` until `shutdown` is cancelled.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

// --- Errors ---

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn storage_error(e: StorageError) -> ApiError {
    match e {
        StorageError::RunNotFound(_)
        | StorageError::StepNotFound(_)
        | StorageError::StoryNotFound(_) => api_error(StatusCode::NOT_FOUND, e.to_string()),
        StorageError::Database(_) => {
            error!("storage error: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn engine_error(e: EngineError) -> ApiError {
    match e {
        EngineError::Storage(e) => storage_error(e),
        EngineError::InvalidTransition { .. } => {
            warn!("{}", e);
            api_error(StatusCode::CONFLICT, e.to_string())
        }
    }
}

fn workflow_error(workflow: &str, e: WorkflowError) -> ApiError {
    match &e {
        WorkflowError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => api_error(
            StatusCode::NOT_FOUND,
            format!("workflow not found: {workflow}"),
        ),
        WorkflowError::Io(_) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        WorkflowError::Parse(_) | WorkflowError::Invalid { .. } => {
            api_error(StatusCode::BAD_REQUEST, e.to_string())
        }
    }
}

fn require(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("{field} must not be empty"),
        ));
    }
    Ok(())
}

/// Workflow ids name a directory; refuse anything that could escape it.
fn valid_workflow_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !id.starts_with('.')
}

// --- Request/Response types ---

/// Request payload for POST /runs.
#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub workflow: String,
    pub task: String,
    #[serde(default)]
    pub notify_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub run: Run,
}

/// Query params for GET /runs.
#[derive(Debug, Deserialize, Default)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub workflow: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListRunsResponse {
    pub runs: Vec<Run>,
}

#[derive(Debug, Serialize)]
pub struct ListStepsResponse {
    pub steps: Vec<Step>,
}

#[derive(Debug, Serialize)]
pub struct ListStoriesResponse {
    pub stories: Vec<Story>,
}

#[derive(Debug, Serialize)]
pub struct ListEventsResponse {
    pub events: Vec<Event>,
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub agent_id: String,
}

/// `{"found": false}` or `{"found": true, "step_id": ..., ...}`.
#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub found: bool,
    #[serde(flatten)]
    pub step: Option<ClaimedStep>,
}

#[derive(Debug, Deserialize)]
pub struct PeekQuery {
    #[serde(default)]
    pub agent_id: String,
}

#[derive(Debug, Serialize)]
pub struct PeekResponse {
    pub has_work: bool,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub output: String,
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    #[serde(default)]
    pub error: String,
}

// --- Handlers ---

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /runs - Start a run of a workflow.
async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require("workflow", &req.workflow)?;
    require("task", &req.task)?;
    if !valid_workflow_id(&req.workflow) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("invalid workflow id: {}", req.workflow),
        ));
    }

    let spec = WorkflowSpec::load(&state.workflows_dir.join(&req.workflow))
        .map_err(|e| workflow_error(&req.workflow, e))?;
    // Trigger setup finds the definition again by run.workflow_id.
    if spec.id != req.workflow {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!(
                "workflow directory {} declares id {}",
                req.workflow, spec.id
            ),
        ));
    }
    let notify_url = req.notify_url.filter(|u| !u.trim().is_empty());

    let run = state
        .engine
        .start_run(&spec, &req.task, notify_url)
        .await
        .map_err(engine_error)?;

    Ok((StatusCode::CREATED, Json(RunResponse { run })))
}

/// GET /runs - List runs, newest first.
async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRunsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let runs = state
        .storage
        .list_runs(query.workflow.as_deref())
        .await
        .map_err(storage_error)?;
    Ok(Json(ListRunsResponse { runs }))
}

/// GET /runs/{id}
async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .storage
        .get_run(&Id::from_string(id))
        .await
        .map_err(storage_error)?;
    Ok(Json(RunResponse { run }))
}

/// GET /runs/{id}/steps
async fn list_steps(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = Id::from_string(id);
    state.storage.get_run(&run_id).await.map_err(storage_error)?;
    let steps = state
        .storage
        .list_steps(&run_id)
        .await
        .map_err(storage_error)?;
    Ok(Json(ListStepsResponse { steps }))
}

/// GET /runs/{id}/stories
async fn list_stories(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = Id::from_string(id);
    state.storage.get_run(&run_id).await.map_err(storage_error)?;
    let stories = state
        .storage
        .list_stories(&run_id)
        .await
        .map_err(storage_error)?;
    Ok(Json(ListStoriesResponse { stories }))
}

/// GET /runs/{id}/events - Audit log for a run.
async fn list_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = Id::from_string(id);
    state.storage.get_run(&run_id).await.map_err(storage_error)?;
    let events = state
        .storage
        .list_events(&run_id)
        .await
        .map_err(storage_error)?;
    Ok(Json(ListEventsResponse { events }))
}

/// POST /steps/claim
async fn claim_step(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClaimRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require("agent_id", &req.agent_id)?;
    let claim = state
        .engine
        .claim(req.agent_id.trim())
        .await
        .map_err(engine_error)?;
    let response = match claim {
        Claim::NotFound => ClaimResponse {
            found: false,
            step: None,
        },
        Claim::Found(step) => ClaimResponse {
            found: true,
            step: Some(step),
        },
    };
    Ok(Json(response))
}

/// GET /steps/peek?agent_id=
async fn peek_step(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PeekQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require("agent_id", &query.agent_id)?;
    let has_work = state
        .engine
        .peek(query.agent_id.trim())
        .await
        .map_err(engine_error)?;
    Ok(Json(PeekResponse { has_work }))
}

/// POST /steps/{id}/complete
async fn complete_step(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CompleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .engine
        .complete(&Id::from_string(id), &req.output)
        .await
        .map_err(engine_error)?;
    Ok(Json(result))
}

/// POST /steps/{id}/fail
async fn fail_step(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<FailRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .engine
        .fail(&Id::from_string(id), &req.error)
        .await
        .map_err(engine_error)?;
    Ok(Json(result))
}
