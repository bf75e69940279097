//! Operational endpoints owned by the infrastructure layer.
//!
//! Business routes (tasks, workspaces, services) are mounted by the route
//! layer and wrapped with [`crate::server::apply_pipeline`]; only health,
//! metrics and performance introspection live here.

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::server::AppState;

pub async fn root() -> impl IntoResponse {
    Json(json!({
        "name": "taskhive",
        "status": "ok",
    }))
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.cache.stats();
    // Redis being down is not a readiness failure: the local tier serves.
    let redis_available = state.cache.is_redis_available().await;
    Json(json!({
        "status": "ok",
        "cache": {
            "mode": stats.mode,
            "localEntries": stats.local_entries,
            "redisAvailable": redis_available,
        },
    }))
}

/// Prometheus metrics in text format.
pub async fn metrics() -> Response {
    match crate::metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct SummaryParams {
    /// Trailing window in milliseconds; defaults to 5 minutes.
    #[serde(rename = "windowMs")]
    pub window_ms: Option<u64>,
}

/// Snapshot of the in-process performance monitor.
pub async fn performance_summary(
    State(state): State<AppState>,
    Query(params): Query<SummaryParams>,
) -> impl IntoResponse {
    Json(state.monitor.summary(params.window_ms))
}
