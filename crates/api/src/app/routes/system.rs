use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;

use eva_infra::{Engine, UNHEALTHY_STATUS};
use eva_observability::InMemoryMetrics;

use crate::app::errors;

/// 200 when healthy, 555 otherwise; the body is the full report either way.
pub async fn health(Extension(engine): Extension<Arc<Engine>>) -> impl IntoResponse {
    let report = engine.health_report(Utc::now());
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::from_u16(UNHEALTHY_STATUS).unwrap_or(StatusCode::SERVICE_UNAVAILABLE)
    };
    (status, Json(report))
}

pub async fn stats(Extension(engine): Extension<Arc<Engine>>) -> axum::response::Response {
    match engine.stats() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn metrics(Extension(metrics): Extension<Arc<InMemoryMetrics>>) -> impl IntoResponse {
    Json(metrics.snapshot())
}
