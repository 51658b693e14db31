//! Runtime control: drain mode, shutdown and the timestamp threshold.

use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use serde_json::json;
use tracing::info;

use eva_infra::Engine;

use crate::app::dto::{DrainRequest, ShutdownRequest, ThresholdRequest};
use crate::app::errors;

pub fn router() -> Router {
    Router::new()
        .route("/drain", post(drain))
        .route("/shutdown", post(shutdown))
        .route("/threshold", post(threshold))
}

pub async fn drain(Extension(engine): Extension<Arc<Engine>>, Json(req): Json<DrainRequest>) -> impl IntoResponse {
    engine.set_draining(req.enabled);
    Json(json!({ "draining": engine.is_draining() }))
}

pub async fn shutdown(Extension(engine): Extension<Arc<Engine>>, Json(req): Json<ShutdownRequest>) -> impl IntoResponse {
    let mode = req.mode();
    info!(?mode, "shutdown requested over admin surface");
    engine.request_shutdown(mode);
    (
        StatusCode::ACCEPTED,
        Json(json!({ "requested": mode, "effective": engine.shutdown_requested() })),
    )
}

pub async fn threshold(
    Extension(engine): Extension<Arc<Engine>>,
    Json(req): Json<ThresholdRequest>,
) -> axum::response::Response {
    match engine.set_message_timestamp_threshold(req.timestamp) {
        Ok(()) => Json(json!({ "message_timestamp_threshold": req.timestamp })).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}
