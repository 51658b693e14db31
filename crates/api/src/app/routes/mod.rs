use axum::{
    routing::{get, post},
    Router,
};

pub mod control;
pub mod jobs;
pub mod system;

/// Router for every admin endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .route("/stats", get(system::stats))
        .route("/metrics", get(system::metrics))
        .route("/events", get(jobs::list_events))
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/:id", get(jobs::get_job).delete(jobs::delete_job))
        .route("/process", post(jobs::process))
        .nest("/control", control::router())
}
