//! Tracing, logging, metrics (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Metrics sink abstraction and counter names.
pub mod metrics;

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics, Tags, TracingMetrics};
