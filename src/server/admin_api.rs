//! Admin HTTP API.
//!
//! - GET /health
//! - GET /v1/connector/stats
//! - GET /v1/connector/requests/{request_id}
//! - GET /metrics

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::cache::state::TransferStatus;
use crate::connector::base::{BackendStats, SchedulerConnector, WorkerConnector};
use crate::metrics;
use crate::transfer::health::HealthSnapshot;

/// Application state shared across handlers.
pub struct AdminState {
    pub connector: String,
    pub engine_id: String,
    pub scheduler: Mutex<Box<dyn SchedulerConnector>>,
    pub workers: Vec<Arc<dyn WorkerConnector>>,
    pub start_time: Instant,
}

impl AdminState {
    fn backend_stats(&self) -> Vec<BackendStats> {
        self.workers.iter().flat_map(|w| w.backend_stats()).collect()
    }
}

/// Build the axum router with all admin routes.
pub fn build_router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/connector/stats", get(connector_stats))
        .route("/v1/connector/requests/{request_id}", get(request_status))
        .route("/metrics", get(prometheus_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub connector: String,
    pub engine_id: String,
    pub uptime_secs: u64,
    pub backends: Vec<HealthSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub connector: String,
    pub scheduler: String,
    pub backends: Vec<BackendStats>,
}

#[derive(Debug, Serialize)]
pub struct RequestStatusResponse {
    pub request_id: String,
    pub status: TransferStatus,
}

async fn health(State(state): State<Arc<AdminState>>) -> Json<HealthResponse> {
    let backends: Vec<HealthSnapshot> = state
        .backend_stats()
        .into_iter()
        .map(|stats| stats.health)
        .collect();
    let status = if backends.iter().any(|b| b.degraded) {
        "degraded"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status: status.to_string(),
        connector: state.connector.clone(),
        engine_id: state.engine_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        backends,
    })
}

async fn connector_stats(State(state): State<Arc<AdminState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        connector: state.connector.clone(),
        scheduler: state.scheduler.lock().name().to_string(),
        backends: state.backend_stats(),
    })
}

/// Merged transfer status the scheduler half tracks for one request.
async fn request_status(
    State(state): State<Arc<AdminState>>,
    Path(request_id): Path<String>,
) -> Result<Json<RequestStatusResponse>, StatusCode> {
    let status = state
        .scheduler
        .lock()
        .transfer_status(&request_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(RequestStatusResponse { request_id, status }))
}

async fn prometheus_metrics() -> impl IntoResponse {
    match metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
