//! HTTP API for the preview manager.
//!
//! POST   /preview/:project_id - Start (or replace) a project's preview
//! GET    /preview/:project_id - Current preview state
//! DELETE /preview/:project_id - Stop a project's preview
//! GET    /preview/status      - Projects joined with their previews
//! DELETE /preview/status      - Stop every preview
//! GET    /preview/health      - Health score and recommendations
//! POST   /preview/health      - Run a maintenance action

pub mod requests;

use crate::error::PreviewError;
use crate::session::{health, MaintenanceAction, PreviewManager};
use axum::extract::{Path, Request, State};
use axum::http::header::{CONTENT_TYPE, ORIGIN};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use requests::{
    HealthResponse, MaintenanceRequest, MaintenanceResponse, PoolHealth, PreviewResponse,
    StopAllResponse, StopResponse, SystemHealth,
};
use std::collections::HashSet;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Shared state for all preview routes.
#[derive(Clone)]
pub struct AppState {
    manager: Arc<PreviewManager>,
    allowed_origins: Arc<HashSet<String>>,
}

impl AppState {
    pub fn new(manager: Arc<PreviewManager>, allowed_origins: impl IntoIterator<Item = String>) -> Self {
        Self {
            manager,
            allowed_origins: Arc::new(allowed_origins.into_iter().collect()),
        }
    }

    pub fn manager(&self) -> &Arc<PreviewManager> {
        &self.manager
    }
}

/// Build the router with tracing, CORS and the origin check applied.
pub fn router(state: AppState) -> Router {
    let origins: Vec<HeaderValue> = state
        .allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([CONTENT_TYPE]);

    Router::new()
        .route("/preview/status", get(overview).delete(stop_all))
        .route("/preview/health", get(health_report).post(run_maintenance))
        .route(
            "/preview/:project_id",
            get(preview_status).post(start_preview).delete(stop_preview),
        )
        .layer(middleware::from_fn_with_state(state.clone(), check_origin))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Requests without an `Origin` header (curl, server-to-server) pass.
fn origin_allowed(headers: &HeaderMap, allowed: &HashSet<String>) -> bool {
    match headers.get(ORIGIN).map(|v| v.to_str()) {
        None => true,
        Some(Ok(origin)) => allowed.contains(origin),
        Some(Err(_)) => false,
    }
}

async fn check_origin(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !origin_allowed(req.headers(), &state.allowed_origins) {
        warn!(origin = ?req.headers().get(ORIGIN), "Rejected request from disallowed origin");
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    next.run(req).await
}

async fn start_preview(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<PreviewResponse>, PreviewError> {
    let info = state.manager.start_preview(&project_id).await?;
    Ok(Json(info.into()))
}

async fn preview_status(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Json<PreviewResponse> {
    Json(state.manager.get_status(&project_id).into())
}

async fn stop_preview(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Json<StopResponse> {
    let stopped = state.manager.stop_preview(&project_id).await;
    debug!(project_id = %project_id, stopped, "Stop requested");
    Json(StopResponse { stopped })
}

async fn overview(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.overview())
}

async fn stop_all(State(state): State<AppState>) -> Json<StopAllResponse> {
    let stopped_count = state.manager.stop_all().await;
    Json(StopAllResponse { stopped_count })
}

async fn health_report(State(state): State<AppState>) -> Json<HealthResponse> {
    let manager = &state.manager;
    let memory = health::memory_snapshot();
    let inputs = manager.health_inputs(memory.map(|m| m.percent));
    let assessment = health::assess(&inputs);

    Json(HealthResponse::new(
        assessment,
        SystemHealth {
            memory,
            uptime: manager.uptime().as_secs(),
        },
        PoolHealth {
            active_sessions: inputs.active_sessions,
            max_sessions: inputs.max_sessions,
            port_usage: manager.port_usage(),
        },
    ))
}

async fn run_maintenance(
    State(state): State<AppState>,
    Json(req): Json<MaintenanceRequest>,
) -> Result<Json<MaintenanceResponse>, PreviewError> {
    let action: MaintenanceAction = req.action.parse()?;
    let results = state.manager.maintain(action).await;
    Ok(Json(MaintenanceResponse { action, results }))
}
