//! Health check handlers for queue workers.
//!
//! Reusable Axum handlers for:
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`), ready while the worker is running
//! - Prometheus metrics (`/metrics`)

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::metrics;
use crate::worker::EngineState;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    /// Application name.
    pub app_name: String,
    /// Application version.
    pub app_version: String,
    /// Queue key the worker consumes.
    pub queue: String,
    engine: watch::Receiver<EngineState>,
}

impl HealthState {
    /// `engine` comes from [`QueueWorker::subscribe_state`](crate::QueueWorker::subscribe_state).
    pub fn new(
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        queue: impl Into<String>,
        engine: watch::Receiver<EngineState>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            queue: queue.into(),
            engine,
        }
    }

    pub fn engine_state(&self) -> EngineState {
        *self.engine.borrow()
    }
}

/// Liveness response body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub name: String,
    pub version: String,
}

/// Liveness probe handler.
///
/// Always returns OK if the server is running.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
///
/// Ready only while the worker is in [`EngineState::Running`].
pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    let engine = state.engine_state();
    let (code, status) = match engine {
        EngineState::Running => (StatusCode::OK, "ready"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "not_ready"),
    };

    (
        code,
        Json(json!({
            "status": status,
            "queue": state.queue,
            "engine": engine.as_str(),
        })),
    )
}

/// Prometheus metrics endpoint handler.
///
/// Returns metrics in Prometheus text format for scraping.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::render_metrics() {
        Some(rendered) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            rendered,
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Metrics recorder not initialized",
        )
            .into_response(),
    }
}

/// Create a standard health router.
///
/// - `/health`, `/healthz` - Liveness probe
/// - `/ready`, `/readyz` - Readiness probe
/// - `/metrics` - Prometheus metrics
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
