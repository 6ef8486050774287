//! The `/metrics/*` and `/health` HTTP surface (spec §6.1), shaped after
//! `stream_worker::health`'s `HealthState` + `axum::Router` pattern:
//! handlers returning `Json<T>` or `(StatusCode, Json<Value>)`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use core_config::AppInfo;
use serde_json::{json, Value};

use crate::monitor::SystemMonitor;

#[derive(Clone)]
pub struct HealthState {
    pub monitor: &'static SystemMonitor,
    pub app_info: AppInfo,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics/prometheus", get(prometheus_handler))
        .route("/metrics/snapshot", get(snapshot_handler))
        .route("/metrics/performance", get(performance_handler))
        .route("/metrics/health", get(metrics_health_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<HealthState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "name": state.app_info.name,
        "version": state.app_info.version,
    }))
}

fn error_envelope(operation: &str, error: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "success": false,
            "error": error.to_string(),
            "operation": operation,
        })),
    )
}

async fn prometheus_handler(State(state): State<HealthState>) -> impl IntoResponse {
    match state.monitor.prometheus_handle() {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => error_envelope("get_prometheus_metrics", "prometheus exporter not initialized").into_response(),
    }
}

async fn snapshot_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let snapshot = state.monitor.get_system_metrics();
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "data": snapshot,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}

async fn performance_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let snapshot = state.monitor.get_system_metrics();
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "data": snapshot,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}

/// `< 10 errors ∧ < 5000ms request duration ∧ < 500MiB memory` ⇒
/// `healthy`; thresholds are strict, exact equality is `degraded`.
fn derive_metrics_health(error_count: u64, request_duration_ms: u64, memory_usage_bytes: u64) -> &'static str {
    const MEMORY_LIMIT: u64 = 500 * 1024 * 1024;
    if error_count < 10 && request_duration_ms < 5000 && memory_usage_bytes < MEMORY_LIMIT {
        "healthy"
    } else {
        "degraded"
    }
}

async fn metrics_health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let snapshot = state.monitor.get_system_metrics();
    // Per-request duration isn't tracked at this layer; absent -> falsy per spec.
    let status = derive_metrics_health(snapshot.total_errors, 0, snapshot.memory_usage_bytes);
    (
        StatusCode::OK,
        Json(json!({
            "status": status,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}
