use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use serde_json::json;

use eva_core::FlatConfig;
use eva_events::{ResourceDescriptor, ResourceRef};
use eva_infra::{
    AdapterRegistry, BackendRegistry, Engine, EngineConfig, EngineParts, InMemoryCheckpointStore,
    InMemoryMetadataStore, ShutdownMode,
};
use eva_observability::InMemoryMetrics;

struct TestServer {
    base_url: String,
    engine: Arc<Engine>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(EngineConfig::default()).await
    }

    /// Same router as prod, with in-memory collaborators, on an ephemeral port.
    /// The scheduler loops are not started; tests drive them explicitly.
    async fn spawn_with(config: EngineConfig) -> Self {
        let flat = FlatConfig::new()
            .with_section("executor.null", [("class", "null")])
            .with_section("adapter.noop", [("class", "null"), ("executor", "null")]);
        let backends = BackendRegistry::from_config(&flat).unwrap();
        let adapters = AdapterRegistry::from_config(&flat, &backends.ids()).unwrap();

        let metadata = InMemoryMetadataStore::arc();
        metadata.upsert(ResourceDescriptor::new(ResourceRef::new("res://a"), 1));
        let metrics = InMemoryMetrics::arc();
        let engine = Arc::new(
            Engine::new(
                config,
                EngineParts {
                    adapters,
                    backends,
                    metadata,
                    checkpoints: InMemoryCheckpointStore::arc(),
                    metrics: metrics.clone(),
                },
            )
            .unwrap(),
        );

        let app = eva_api::app::build_app(engine.clone(), metrics);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            engine,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["healthy"], json!(true));
    assert_eq!(body["queue_connected"], json!(true));
}

#[tokio::test]
async fn missed_heartbeat_reports_555() {
    let server = TestServer::spawn_with(EngineConfig::default().with_heartbeat(Duration::ZERO, Duration::ZERO)).await;
    let client = reqwest::Client::new();

    let res = client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(res.status().as_u16(), 555);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["healthy"], json!(false));

    // Heartbeats are not checked while draining.
    client
        .post(server.url("/control/drain"))
        .json(&json!({ "enabled": true }))
        .send()
        .await
        .unwrap();
    let res = client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn injected_event_becomes_a_job_and_finishes() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/process"))
        .json(&json!({ "reference": "res://a" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = res.json().await.unwrap();
    let event_id = body["event_id"].as_str().unwrap().to_string();

    let events: Vec<serde_json::Value> = client.get(server.url("/events")).send().await.unwrap().json().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event"]["id"], json!(event_id));

    server.engine.schedule_once(Utc::now()).unwrap();
    let jobs: Vec<serde_json::Value> = client.get(server.url("/jobs")).send().await.unwrap().json().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["id"], json!(format!("{event_id}.noop.0")));
    assert_eq!(jobs[0]["status"], json!("started"));

    server.engine.schedule_once(Utc::now()).unwrap();
    let jobs: Vec<serde_json::Value> = client.get(server.url("/jobs")).send().await.unwrap().json().await.unwrap();
    assert!(jobs.is_empty());

    let stats: serde_json::Value = client.get(server.url("/stats")).send().await.unwrap().json().await.unwrap();
    assert_eq!(stats["events_held"], json!(0));

    let metrics: serde_json::Value = client.get(server.url("/metrics")).send().await.unwrap().json().await.unwrap();
    assert_eq!(metrics["counters"]["eva_event_admitted"], json!(1));
}

#[tokio::test]
async fn process_rejects_unknown_adapter_and_empty_reference() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/process"))
        .json(&json!({ "reference": "res://a", "adapters": ["missing"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], json!("unknown_adapter"));

    let res = client
        .post(server.url("/process"))
        .json(&json!({ "reference": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn drain_blocks_injection_until_lifted() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/control/drain"))
        .json(&json!({ "enabled": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let stats: serde_json::Value = client.get(server.url("/stats")).send().await.unwrap().json().await.unwrap();
    assert_eq!(stats["draining"], json!(true));

    let res = client
        .post(server.url("/process"))
        .json(&json!({ "reference": "res://a" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    client
        .post(server.url("/control/drain"))
        .json(&json!({ "enabled": false }))
        .send()
        .await
        .unwrap();
    let res = client
        .post(server.url("/process"))
        .json(&json!({ "reference": "res://a" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn deleting_jobs() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.delete(server.url("/jobs/nope")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    client
        .post(server.url("/process"))
        .json(&json!({ "reference": "res://a" }))
        .send()
        .await
        .unwrap();
    server.engine.schedule_once(Utc::now()).unwrap();
    let jobs: Vec<serde_json::Value> = client.get(server.url("/jobs")).send().await.unwrap().json().await.unwrap();
    let id = jobs[0]["id"].as_str().unwrap().to_string();

    // STARTED jobs cannot be deleted.
    let res = client.delete(server.url(&format!("/jobs/{id}"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn threshold_and_shutdown_controls() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/control/threshold"))
        .json(&json!({ "timestamp": "2030-01-01T00:00:00Z" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let stats: serde_json::Value = client.get(server.url("/stats")).send().await.unwrap().json().await.unwrap();
    assert_eq!(stats["message_timestamp_threshold"], json!("2030-01-01T00:00:00Z"));

    let res = client
        .post(server.url("/control/shutdown"))
        .json(&json!({ "graceful": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    assert_eq!(server.engine.shutdown_requested(), Some(ShutdownMode::Graceful));
    // Held work keeps running; only new events are refused.
    assert!(!server.engine.is_draining());
    let res = client
        .post(server.url("/process"))
        .json(&json!({ "reference": "res://a" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    // Immediate wins over graceful and is never downgraded.
    client
        .post(server.url("/control/shutdown"))
        .json(&json!({ "graceful": false }))
        .send()
        .await
        .unwrap();
    client
        .post(server.url("/control/shutdown"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(server.engine.shutdown_requested(), Some(ShutdownMode::Immediate));
}
