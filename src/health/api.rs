//! Health check endpoints

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;

use super::{HealthMonitor, HealthReport, HealthStatus};

/// Readiness probe response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<HealthStatus>,
}

/// Liveness probe response
#[derive(Debug, Serialize)]
pub struct LiveResponse {
    pub status: &'static str,
    pub version: &'static str,
}

fn status_code(report: &HealthReport) -> StatusCode {
    if report.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

/// Full check - probes every dependency now
async fn health(State(monitor): State<HealthMonitor>) -> (StatusCode, Json<HealthReport>) {
    let report = monitor.check_health().await;
    (status_code(&report), Json(report))
}

/// Cached report, running a check only if none has been made yet
async fn quick(State(monitor): State<HealthMonitor>) -> (StatusCode, Json<HealthReport>) {
    let report = match monitor.latest() {
        Some(report) => report,
        None => monitor.check_health().await,
    };
    (status_code(&report), Json(report))
}

/// Readiness probe - is the bridge able to take traffic?
async fn ready(State(monitor): State<HealthMonitor>) -> (StatusCode, Json<ReadyResponse>) {
    let ready = monitor.is_ready();
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(ReadyResponse {
            ready,
            status: monitor.latest().map(|r| r.status),
        }),
    )
}

/// Liveness probe - is the process running?
async fn live() -> Json<LiveResponse> {
    Json(LiveResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Build the health router
pub fn router(monitor: HealthMonitor) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/quick", get(quick))
        .route("/ready", get(ready))
        .route("/live", get(live))
        .with_state(monitor)
}
