//! Admin surface wiring (Axum router + process services).
//!
//! - `services.rs`: builds the engine and its collaborators from the environment
//! - `routes/`: HTTP handlers (system, control, jobs)
//! - `dto.rs`: request/response bodies
//! - `errors.rs`: consistent error responses

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response, routing::get, Extension, Router};
use tower::ServiceBuilder;
use tracing::debug;

use eva_infra::Engine;
use eva_observability::InMemoryMetrics;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full admin router (public entrypoint used by `main.rs` and the
/// black-box tests).
pub fn build_app(engine: Arc<Engine>, metrics: Arc<InMemoryMetrics>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(log_request))
                .layer(Extension(engine))
                .layer(Extension(metrics)),
        )
}

async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(req).await;
    debug!(
        %method,
        path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "admin request"
    );
    response
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use eva_core::FlatConfig;
    use eva_infra::{AdapterRegistry, BackendRegistry, EngineConfig, EngineParts, InMemoryCheckpointStore, InMemoryMetadataStore};

    use super::*;

    fn app() -> Router {
        let flat = FlatConfig::new()
            .with_section("executor.null", [("class", "null")])
            .with_section("adapter.noop", [("class", "null"), ("executor", "null")]);
        let backends = BackendRegistry::from_config(&flat).unwrap();
        let adapters = AdapterRegistry::from_config(&flat, &backends.ids()).unwrap();
        let metrics = InMemoryMetrics::arc();
        let engine = Engine::new(
            EngineConfig::default(),
            EngineParts {
                adapters,
                backends,
                metadata: InMemoryMetadataStore::arc(),
                checkpoints: InMemoryCheckpointStore::arc(),
                metrics: metrics.clone(),
            },
        )
        .unwrap();
        build_app(Arc::new(engine), metrics)
    }

    #[tokio::test]
    async fn health_is_ok_by_default() {
        let res = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let res = app()
            .oneshot(Request::get("/jobs/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
