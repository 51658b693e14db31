use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use eva_infra::{Coordinator, Engine, ShutdownMode};

/// Resolves once the scheduler has stopped, or on Ctrl-C after requesting
/// a graceful shutdown.
async fn shutdown_signal(engine: Arc<Engine>) {
    let stopped = async {
        while !engine.is_stopped() {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received; finishing held events");
            engine.request_shutdown(ShutdownMode::Graceful);
        }
        _ = stopped => {}
    }
}

fn shutdown_timeout() -> Duration {
    std::env::var("EVA_SHUTDOWN_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(300))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eva_observability::init();

    let services = eva_api::app::services::build_from_env().await?;
    let engine = services.engine.clone();

    // Restore talks to the checkpoint store synchronously.
    let coordinator = {
        let engine = engine.clone();
        let source = services.source.clone();
        tokio::task::spawn_blocking(move || Coordinator::spawn(engine, source)).await??
    };
    let restored = coordinator.restored();
    info!(
        events = restored.events,
        jobs = restored.jobs,
        corrupt = restored.corrupt,
        "scheduler running"
    );

    let app = eva_api::app::build_app(engine.clone(), services.metrics.clone());
    let bind = std::env::var("EVA_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(engine.clone()))
        .await?;

    let timeout = shutdown_timeout();
    let (drained, fatal) = tokio::task::spawn_blocking(move || {
        let fatal = coordinator.fatal_error();
        if engine.shutdown_requested() == Some(ShutdownMode::Immediate) {
            coordinator.shutdown();
            (false, fatal)
        } else {
            (coordinator.graceful_shutdown(timeout), fatal)
        }
    })
    .await?;
    if let Some(reason) = fatal {
        anyhow::bail!("scheduler stopped on a fatal error: {reason}");
    }
    if !drained {
        warn!("stopped with jobs still running; they resume on next start");
    }
    info!("scheduler stopped");
    Ok(())
}
