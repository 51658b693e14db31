//! Job and event inspection, job deletion and manual event injection.
//!
//! Deletion and injection write checkpoints, which may block on the store,
//! so they run on the blocking pool.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::info;

use eva_core::{AdapterId, JobId};
use eva_events::ResourceRef;
use eva_infra::Engine;

use crate::app::dto::{JobView, ProcessRequest, ProcessResponse};
use crate::app::errors;

pub async fn list_jobs(Extension(engine): Extension<Arc<Engine>>) -> impl IntoResponse {
    let jobs: Vec<JobView> = engine.jobs().into_iter().map(JobView::from).collect();
    Json(jobs)
}

pub async fn get_job(Extension(engine): Extension<Arc<Engine>>, Path(id): Path<String>) -> axum::response::Response {
    match engine.job(&JobId::new(id.clone())) {
        Some(job) => Json(JobView::from(job)).into_response(),
        None => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
    }
}

pub async fn delete_job(Extension(engine): Extension<Arc<Engine>>, Path(id): Path<String>) -> axum::response::Response {
    let job_id = JobId::new(id);
    let deleted = tokio::task::spawn_blocking(move || engine.delete_job(&job_id)).await;
    match deleted {
        Ok(Ok(job)) => Json(JobView::from(job)).into_response(),
        Ok(Err(e)) => errors::engine_error_to_response(e),
        Err(e) => errors::join_error_to_response(e),
    }
}

pub async fn list_events(Extension(engine): Extension<Arc<Engine>>) -> axum::response::Response {
    match engine.events() {
        Ok(events) => Json(events).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn process(Extension(engine): Extension<Arc<Engine>>, Json(req): Json<ProcessRequest>) -> axum::response::Response {
    let reference = req.reference.trim().to_string();
    if reference.is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "reference must not be empty");
    }
    let adapters: Vec<AdapterId> = req.adapters.into_iter().map(AdapterId::new).collect();

    let injected =
        tokio::task::spawn_blocking(move || engine.inject(ResourceRef::new(reference), adapters)).await;
    match injected {
        Ok(Ok(event_id)) => {
            info!(event_id = %event_id, "event injected");
            (
                StatusCode::ACCEPTED,
                Json(ProcessResponse {
                    event_id: event_id.into_inner(),
                }),
            )
                .into_response()
        }
        Ok(Err(e)) => errors::engine_error_to_response(e),
        Err(e) => errors::join_error_to_response(e),
    }
}
