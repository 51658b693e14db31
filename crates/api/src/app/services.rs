//! Process wiring: engine, stores and message queue from the environment.
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `EVA_CONFIG` | JSON file with `adapter.*` / `executor.*` sections |
//! | `DATABASE_URL` | Postgres checkpoint store (in-memory otherwise) |
//! | `REDIS_URL` | Redis Streams message queue (`redis` feature) |
//! | `EVA_METADATA_SEED` | JSON array of resources preloaded into the metadata store |
//!
//! Engine tunables (`EVA_ORDERING`, `EVA_DEDUP_WINDOW`, ...) are read by
//! [`EngineConfig::from_env`].

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tracing::{info, warn};

use eva_core::FlatConfig;
use eva_events::MessageQueue;
use eva_infra::checkpoint::CheckpointStore;
use eva_infra::{
    AdapterRegistry, BackendRegistry, Engine, EngineConfig, EngineParts, InMemoryCheckpointStore,
    InMemoryMetadataStore, PostgresCheckpointStore,
};
use eva_observability::InMemoryMetrics;

/// Everything `main` needs to run the scheduler and its admin surface.
pub struct Services {
    pub engine: Arc<Engine>,
    pub metrics: Arc<InMemoryMetrics>,
    /// `None` when no broker is configured; events then only arrive through
    /// manual injection.
    pub source: Option<Arc<dyn MessageQueue>>,
}

/// Configuration used when `EVA_CONFIG` is not set: one null adapter on a
/// null backend, which is enough to exercise the pipeline end to end.
fn fallback_config() -> FlatConfig {
    FlatConfig::new()
        .with_section("executor.null", [("class", "null")])
        .with_section("adapter.null", [("class", "null"), ("executor", "null")])
}

fn load_flat_config() -> anyhow::Result<FlatConfig> {
    let Ok(path) = std::env::var("EVA_CONFIG") else {
        warn!("EVA_CONFIG not set; running with a single null adapter");
        return Ok(fallback_config());
    };
    let raw = std::fs::read_to_string(&path).with_context(|| format!("cannot read {path}"))?;
    let value: serde_json::Value = serde_json::from_str(&raw).with_context(|| format!("{path} is not valid JSON"))?;
    Ok(FlatConfig::from_json(&value)?)
}

fn load_metadata() -> anyhow::Result<Arc<InMemoryMetadataStore>> {
    let metadata = InMemoryMetadataStore::arc();
    if let Ok(path) = std::env::var("EVA_METADATA_SEED") {
        let raw = std::fs::read_to_string(&path).with_context(|| format!("cannot read {path}"))?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        let n = metadata
            .seed_from_json(value)
            .with_context(|| format!("{path} is not a list of resources"))?;
        info!(resources = n, "metadata store seeded");
    }
    Ok(metadata)
}

async fn checkpoint_store() -> anyhow::Result<Arc<dyn CheckpointStore>> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        warn!("DATABASE_URL not set; checkpoints are kept in memory and lost on restart");
        return Ok(InMemoryCheckpointStore::arc());
    };
    let pool = PgPool::connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PostgresCheckpointStore::new(pool, tokio::runtime::Handle::current());
    store.ensure_schema().await?;
    info!("using Postgres checkpoint store");
    Ok(Arc::new(store))
}

#[cfg(feature = "redis")]
async fn message_source() -> anyhow::Result<Option<Arc<dyn MessageQueue>>> {
    use eva_infra::consumer::{RedisStreamsQueue, RedisStreamsQueueConfig};

    let Ok(redis_url) = std::env::var("REDIS_URL") else {
        warn!("REDIS_URL not set; no message queue attached");
        return Ok(None);
    };
    let config = RedisStreamsQueueConfig::from_env(redis_url);
    let queue = tokio::task::spawn_blocking(move || RedisStreamsQueue::connect(config)).await??;
    Ok(Some(Arc::new(queue)))
}

#[cfg(not(feature = "redis"))]
async fn message_source() -> anyhow::Result<Option<Arc<dyn MessageQueue>>> {
    if std::env::var("REDIS_URL").is_ok() {
        warn!("REDIS_URL is set but this build has no redis support");
    }
    Ok(None)
}

pub async fn build_from_env() -> anyhow::Result<Services> {
    let config = EngineConfig::from_env()?;
    let flat = load_flat_config()?;
    let backends = BackendRegistry::from_config(&flat)?;
    let adapters = AdapterRegistry::from_config(&flat, &backends.ids())?;
    info!(
        adapters = adapters.len(),
        backends = backends.len(),
        ordering = config.ordering.as_str(),
        "configuration loaded"
    );

    let metrics = InMemoryMetrics::arc();
    let engine = Engine::new(
        config,
        EngineParts {
            adapters,
            backends,
            metadata: load_metadata()?,
            checkpoints: checkpoint_store().await?,
            metrics: metrics.clone(),
        },
    )?;

    Ok(Services {
        engine: Arc::new(engine),
        metrics,
        source: message_source().await?,
    })
}
