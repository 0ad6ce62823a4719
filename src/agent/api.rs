use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use serde::Deserialize;
use tokio::sync::broadcast;

use super::approval::ApprovalPolicies;
use super::engine::{EngineTiming, RunEngine, StartOptions};
use super::models::{AgentCommand, ApprovalDecision, AutopilotPatch, ControlAction, NewAutopilot};
use super::planner::Planner;
use super::registry::RunRegistry;
use super::scheduler::{AutopilotScheduler, SchedulerConfig};
use super::ws::EventSink;
use crate::errors::AgentError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub registry: Arc<RunRegistry>,
    pub engine: RunEngine,
    pub scheduler: Arc<AutopilotScheduler>,
    pub ws_tx: broadcast::Sender<String>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire registry, engine and scheduler around one broadcast channel.
    pub fn assemble(
        planner: Planner,
        policies: ApprovalPolicies,
        timing: EngineTiming,
        scheduler: SchedulerConfig,
        event_buffer: usize,
    ) -> Self {
        let (ws_tx, _) = broadcast::channel(event_buffer.max(1));
        let sink: Arc<dyn EventSink> = Arc::new(ws_tx.clone());
        let registry = Arc::new(RunRegistry::new(sink));
        let engine = RunEngine::new(registry.clone(), planner, policies, timing);
        let scheduler = Arc::new(AutopilotScheduler::new(
            registry.clone(),
            Arc::new(engine.clone()),
            scheduler,
        ));
        Self {
            registry,
            engine,
            scheduler,
            ws_tx,
        }
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct DecisionRequest {
    pub decision: ApprovalDecision,
}

#[derive(Deserialize)]
pub struct ControlRequest {
    pub action: ControlAction,
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    pub channel: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        let message = err.to_string();
        match err {
            AgentError::RunNotFound { .. } | AgentError::AutopilotNotFound { .. } => {
                ApiError::NotFound(message)
            }
            AgentError::Validation(_) => ApiError::BadRequest(message),
            AgentError::InvalidTransition { .. } => ApiError::Conflict(message),
            AgentError::Other(e) => {
                tracing::error!(error = ?e, "request failed");
                ApiError::Internal(message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/agent/command", post(submit_command))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/index", get(runs_index))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/approve", post(decide_run))
        .route("/api/runs/{id}/control", post(control_run))
        .route("/api/autopilots", get(list_autopilots).post(create_autopilot))
        .route("/api/autopilots/preview", post(preview_autopilot))
        .route("/api/autopilots/{id}", patch(update_autopilot))
        .route("/api/autopilots/{id}/run", post(fire_autopilot))
        .route("/api/messages", get(list_messages))
        .route("/api/snapshot", get(snapshot))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn submit_command(
    State(state): State<SharedState>,
    Json(command): Json<AgentCommand>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.engine.start(command, StartOptions::default()).await?;
    Ok(Json(run))
}

async fn list_runs(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.registry.list_runs())
}

async fn runs_index(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.registry.runs_index())
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.registry.get_run(&id) {
        Some(run) => Ok(Json(run)),
        None => Err(AgentError::RunNotFound { id }.into()),
    }
}

async fn decide_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<DecisionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.engine.decide(&id, req.decision)?;
    Ok(Json(run))
}

async fn control_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ControlRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.engine.control(&id, req.action)?;
    Ok(Json(run))
}

async fn list_autopilots(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.registry.list_autopilots())
}

async fn create_autopilot(
    State(state): State<SharedState>,
    Json(req): Json<NewAutopilot>,
) -> Result<impl IntoResponse, ApiError> {
    let autopilot = state.registry.create_autopilot(req)?;
    tracing::info!(autopilot_id = %autopilot.id, cadence = autopilot.cadence.kind(), "autopilot created");
    Ok((StatusCode::CREATED, Json(autopilot)))
}

async fn update_autopilot(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<AutopilotPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let autopilot = state.registry.patch_autopilot(&id, req)?;
    Ok(Json(autopilot))
}

async fn fire_autopilot(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.scheduler.fire_now(&id).await?;
    Ok(Json(run))
}

async fn preview_autopilot(
    State(state): State<SharedState>,
    Json(command): Json<AgentCommand>,
) -> Result<impl IntoResponse, ApiError> {
    command.validate().map_err(ApiError::BadRequest)?;
    let draft = state.engine.planner().propose_autopilot(&command).await;
    Ok(Json(draft))
}

async fn list_messages(
    State(state): State<SharedState>,
    Query(query): Query<MessagesQuery>,
) -> impl IntoResponse {
    Json(state.registry.messages(query.channel.as_deref()))
}

async fn snapshot(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.registry.snapshot())
}
