//! Metrics sink.
//!
//! Components receive an `Arc<dyn MetricsSink>` at construction; nothing in
//! the scheduler reaches for a global registry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

/// Key/value tags attached to a metric sample.
pub type Tags<'a> = &'a [(&'a str, &'a str)];

/// Counter and gauge names emitted by the scheduler.
pub mod names {
    pub const EVENT_ADMITTED: &str = "eva_event_admitted";
    pub const EVENT_DUPLICATE: &str = "eva_event_duplicate";
    pub const EVENT_TOO_OLD: &str = "eva_event_too_old";
    pub const EVENT_HEARTBEAT: &str = "eva_event_heartbeat";
    pub const EVENT_MALFORMED: &str = "eva_event_malformed";
    pub const EVENT_VERSION_UNSUPPORTED: &str = "eva_event_version_unsupported";
    pub const EVENT_RELEASED: &str = "eva_event_released";
    pub const RESOURCE_VERSION_CONFLICT: &str = "eva_resource_version_conflict";
    pub const RESOURCE_RESOLVE_FAILED: &str = "eva_resource_resolve_failed";

    pub const ADAPTER_ACCEPTED: &str = "eva_event_accepted";
    pub const ADAPTER_REJECTED: &str = "eva_event_rejected";
    pub const ADAPTER_ERROR: &str = "eva_adapter_error";

    pub const JOB_CREATED: &str = "eva_job_created";
    pub const JOB_STATUS: &str = "eva_job_status";
    pub const JOB_REQUEUED: &str = "eva_requeued_jobs";
    pub const JOB_REQUEUE_REJECTED: &str = "eva_requeue_rejected";
    pub const JOB_RETRY_EXHAUSTED: &str = "eva_job_retry_exhausted";
    pub const JOB_DERIVED_PERSIST_FAILED: &str = "eva_derived_persist_failed";
    pub const JOB_DISPATCH_FAILED: &str = "eva_job_dispatch_failed";

    pub const RESTORED_EVENTS: &str = "eva_restored_events";
    pub const RESTORED_JOBS: &str = "eva_restored_jobs";
    pub const RESTORED_CORRUPT: &str = "eva_restored_corrupt";

    pub const COMMIT_FAILED: &str = "eva_offset_commit_failed";
    pub const CHECKPOINT_RETRY: &str = "eva_checkpoint_retry";

    pub const GAUGE_EVENT_QUEUE: &str = "eva_event_queue_count";
    pub const GAUGE_JOBS: &str = "eva_job_count";
    pub const GAUGE_JOBS_STARTED: &str = "eva_job_started_count";
}

/// Destination for counters and gauges.
pub trait MetricsSink: Send + Sync {
    fn incr_by(&self, name: &str, value: u64, tags: Tags<'_>);

    fn gauge(&self, name: &str, value: i64, tags: Tags<'_>);

    fn incr(&self, name: &str, tags: Tags<'_>) {
        self.incr_by(name, 1, tags);
    }
}

impl<M> MetricsSink for Arc<M>
where
    M: MetricsSink + ?Sized,
{
    fn incr_by(&self, name: &str, value: u64, tags: Tags<'_>) {
        (**self).incr_by(name, value, tags)
    }

    fn gauge(&self, name: &str, value: i64, tags: Tags<'_>) {
        (**self).gauge(name, value, tags)
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_by(&self, _name: &str, _value: u64, _tags: Tags<'_>) {}

    fn gauge(&self, _name: &str, _value: i64, _tags: Tags<'_>) {}
}

/// Emits every sample as a `tracing` event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn incr_by(&self, name: &str, value: u64, tags: Tags<'_>) {
        tracing::debug!(metric = name, value, tags = %render_tags(tags), "counter");
    }

    fn gauge(&self, name: &str, value: i64, tags: Tags<'_>) {
        tracing::debug!(metric = name, value, tags = %render_tags(tags), "gauge");
    }
}

fn render_tags(tags: Tags<'_>) -> String {
    let mut out = String::new();
    for (i, (k, v)) in tags.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(k);
        out.push('=');
        out.push_str(v);
    }
    out
}

/// Point-in-time copy of an [`InMemoryMetrics`] registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
}

#[derive(Debug, Default)]
struct Registry {
    // metric name -> rendered tags -> value
    counters: BTreeMap<String, BTreeMap<String, u64>>,
    gauges: BTreeMap<String, BTreeMap<String, i64>>,
}

/// Counters kept in memory; read back by tests and the admin surface.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    inner: Mutex<Registry>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Counter total across all tag combinations.
    pub fn counter(&self, name: &str) -> u64 {
        match self.inner.lock() {
            Ok(r) => r.counters.get(name).map(|m| m.values().sum()).unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Counter value for one exact tag combination.
    pub fn counter_tagged(&self, name: &str, tags: Tags<'_>) -> u64 {
        let key = render_tags(tags);
        match self.inner.lock() {
            Ok(r) => r
                .counters
                .get(name)
                .and_then(|m| m.get(&key))
                .copied()
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    pub fn gauge_value(&self, name: &str) -> Option<i64> {
        let r = self.inner.lock().ok()?;
        r.gauges.get(name).and_then(|m| m.get(""))
            .or_else(|| r.gauges.get(name).and_then(|m| m.values().next()))
            .copied()
    }

    /// Flattened view: untagged metrics keep their name, tagged ones are
    /// rendered as `name{k=v}`.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let Ok(r) = self.inner.lock() else {
            return MetricsSnapshot::default();
        };
        let flatten = |name: &str, tags: &str| {
            if tags.is_empty() {
                name.to_string()
            } else {
                format!("{name}{{{tags}}}")
            }
        };
        let mut snapshot = MetricsSnapshot::default();
        for (name, by_tags) in &r.counters {
            for (tags, value) in by_tags {
                snapshot.counters.insert(flatten(name, tags), *value);
            }
        }
        for (name, by_tags) in &r.gauges {
            for (tags, value) in by_tags {
                snapshot.gauges.insert(flatten(name, tags), *value);
            }
        }
        snapshot
    }
}

impl MetricsSink for InMemoryMetrics {
    fn incr_by(&self, name: &str, value: u64, tags: Tags<'_>) {
        if let Ok(mut r) = self.inner.lock() {
            *r.counters
                .entry(name.to_string())
                .or_default()
                .entry(render_tags(tags))
                .or_default() += value;
        }
    }

    fn gauge(&self, name: &str, value: i64, tags: Tags<'_>) {
        if let Ok(mut r) = self.inner.lock() {
            r.gauges
                .entry(name.to_string())
                .or_default()
                .insert(render_tags(tags), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_aggregate_across_tags() {
        let metrics = InMemoryMetrics::new();
        metrics.incr(names::ADAPTER_ACCEPTED, &[("adapter", "a")]);
        metrics.incr(names::ADAPTER_ACCEPTED, &[("adapter", "b")]);
        metrics.incr_by(names::ADAPTER_ACCEPTED, 2, &[("adapter", "a")]);

        assert_eq!(metrics.counter(names::ADAPTER_ACCEPTED), 4);
        assert_eq!(metrics.counter_tagged(names::ADAPTER_ACCEPTED, &[("adapter", "a")]), 3);
        assert_eq!(metrics.counter(names::ADAPTER_REJECTED), 0);
    }

    #[test]
    fn gauges_keep_last_value() {
        let metrics = InMemoryMetrics::new();
        metrics.gauge(names::GAUGE_EVENT_QUEUE, 3, &[]);
        metrics.gauge(names::GAUGE_EVENT_QUEUE, 1, &[]);
        assert_eq!(metrics.gauge_value(names::GAUGE_EVENT_QUEUE), Some(1));
    }

    #[test]
    fn snapshot_renders_tags() {
        let metrics = InMemoryMetrics::new();
        metrics.incr(names::EVENT_ADMITTED, &[]);
        metrics.incr(names::JOB_STATUS, &[("status", "complete")]);

        let snap = metrics.snapshot();
        assert_eq!(snap.counters.get("eva_event_admitted"), Some(&1));
        assert_eq!(snap.counters.get("eva_job_status{status=complete}"), Some(&1));
    }
}
