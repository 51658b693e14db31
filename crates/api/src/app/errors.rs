use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use eva_infra::jobs::LifecycleError;
use eva_infra::EngineError;

pub fn engine_error_to_response(err: EngineError) -> axum::response::Response {
    match err {
        EngineError::Draining => json_error(StatusCode::CONFLICT, "draining", "scheduler is draining"),
        EngineError::QueueFull => json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_full", "event queue is full"),
        EngineError::UnknownAdapter(id) => {
            json_error(StatusCode::BAD_REQUEST, "unknown_adapter", format!("unknown adapter '{id}'"))
        }
        EngineError::Rejected(msg) => json_error(StatusCode::CONFLICT, "rejected", msg),
        EngineError::Lifecycle(LifecycleError::NotFound(id)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        EngineError::Lifecycle(LifecycleError::Busy(id)) => {
            json_error(StatusCode::CONFLICT, "job_running", format!("job {id} is running"))
        }
        EngineError::Checkpoint(e) => json_error(StatusCode::SERVICE_UNAVAILABLE, "checkpoint_error", e.to_string()),
        other => json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", other.to_string()),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// A blocking engine call panicked or was cancelled.
pub fn join_error_to_response(err: tokio::task::JoinError) -> axum::response::Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", err.to_string())
}
