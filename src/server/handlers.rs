use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::metrics::MetricsSnapshot;
use crate::server::state::AppState;

#[derive(Serialize)]
struct HealthStatus {
    status: &'static str,
    uptime_secs: u64,
}

/// Liveness endpoint
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthStatus {
            status: "ok",
            uptime_secs: state.uptime_secs(),
        }),
    )
}

/// Operation counters and monitor tick statistics
pub async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
