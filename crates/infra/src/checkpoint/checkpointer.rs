//! Typed checkpoint access for event records and jobs.

use std::cell::Cell;
use std::sync::Arc;

use tracing::{instrument, warn};

use eva_core::{EventId, JobId};
use eva_observability::{metrics::names, MetricsSink};

use super::r#trait::{CheckpointError, CheckpointKey, CheckpointKind, CheckpointStore};
use crate::jobs::{Job, RetryPolicy};
use crate::queue::EventRecord;
use crate::retry::retry_transient;

/// Everything found in the store at startup.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub events: Vec<EventRecord>,
    pub jobs: Vec<Job>,
    /// Records that could not be decoded; they have been deleted.
    pub corrupt: usize,
}

/// Serializes records as JSON and retries transient store failures.
#[derive(Clone)]
pub struct Checkpointer {
    store: Arc<dyn CheckpointStore>,
    retry: RetryPolicy,
    metrics: Arc<dyn MetricsSink>,
}

impl Checkpointer {
    pub fn new(store: Arc<dyn CheckpointStore>, retry: RetryPolicy, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { store, retry, metrics }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn save_event(&self, record: &EventRecord) -> Result<(), CheckpointError> {
        let body = serde_json::to_vec(record).map_err(|e| CheckpointError::Encode(e.to_string()))?;
        let key = CheckpointKey::event(&record.event.id);
        self.with_retry("checkpoint_put", || self.store.put(&key, &body))
    }

    pub fn remove_event(&self, id: &EventId) -> Result<(), CheckpointError> {
        let key = CheckpointKey::event(id);
        self.with_retry("checkpoint_delete", || self.store.delete(&key))
    }

    pub fn save_job(&self, job: &Job) -> Result<(), CheckpointError> {
        let body = serde_json::to_vec(job).map_err(|e| CheckpointError::Encode(e.to_string()))?;
        let key = CheckpointKey::job(&job.id);
        self.with_retry("checkpoint_put", || self.store.put(&key, &body))
    }

    pub fn remove_job(&self, id: &JobId) -> Result<(), CheckpointError> {
        let key = CheckpointKey::job(id);
        self.with_retry("checkpoint_delete", || self.store.delete(&key))
    }

    /// Read every record. Undecodable records, or records whose key does not
    /// match their content, are deleted and counted.
    #[instrument(skip(self), err)]
    pub fn load(&self) -> Result<Snapshot, CheckpointError> {
        let mut snapshot = Snapshot::default();

        let events = self.with_retry("checkpoint_list", || self.store.list_by_prefix(CheckpointKind::Event))?;
        for (key, body) in events {
            match serde_json::from_slice::<EventRecord>(&body) {
                Ok(record) if CheckpointKey::event(&record.event.id) == key => snapshot.events.push(record),
                Ok(_) => self.discard(&key, "key does not match record", &mut snapshot),
                Err(e) => self.discard(&key, &e.to_string(), &mut snapshot),
            }
        }

        let jobs = self.with_retry("checkpoint_list", || self.store.list_by_prefix(CheckpointKind::Job))?;
        for (key, body) in jobs {
            match serde_json::from_slice::<Job>(&body) {
                Ok(job) if CheckpointKey::job(&job.id) == key => snapshot.jobs.push(job),
                Ok(_) => self.discard(&key, "key does not match record", &mut snapshot),
                Err(e) => self.discard(&key, &e.to_string(), &mut snapshot),
            }
        }

        snapshot.events.sort_by_key(|r| r.arrival);
        Ok(snapshot)
    }

    fn discard(&self, key: &CheckpointKey, reason: &str, snapshot: &mut Snapshot) {
        warn!(key = %key, reason, "discarding corrupt checkpoint record");
        snapshot.corrupt += 1;
        if let Err(e) = self.with_retry("checkpoint_delete", || self.store.delete(key)) {
            warn!(key = %key, error = %e, "failed to delete corrupt checkpoint record");
        }
    }

    fn with_retry<T>(&self, operation: &str, op: impl Fn() -> Result<T, CheckpointError>) -> Result<T, CheckpointError> {
        let attempts = Cell::new(0u64);
        let result = retry_transient(&self.retry, operation, CheckpointError::is_recoverable, || {
            attempts.set(attempts.get() + 1);
            op()
        });
        if attempts.get() > 1 {
            self.metrics
                .incr_by(names::CHECKPOINT_RETRY, attempts.get() - 1, &[("operation", operation)]);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use eva_core::AdapterId;
    use eva_events::{Event, EventPayload, ResourceRef};
    use eva_observability::InMemoryMetrics;

    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::jobs::JobCommand;
    use crate::queue::EventStage;

    fn record(id: &str, arrival: u64) -> EventRecord {
        EventRecord {
            event: Event::new(
                EventId::new(id),
                Utc::now(),
                EventPayload::ResourceUpdated {
                    reference: ResourceRef::new("res://a"),
                    object_version: Some(1),
                },
            ),
            stage: EventStage::Pending,
            arrival,
            admitted_at: Utc::now(),
        }
    }

    fn checkpointer(store: Arc<InMemoryCheckpointStore>, metrics: Arc<InMemoryMetrics>) -> Checkpointer {
        Checkpointer::new(store, RetryPolicy::fixed(3, Duration::ZERO), metrics)
    }

    #[test]
    fn load_returns_saved_records_in_arrival_order() {
        let store = InMemoryCheckpointStore::arc();
        let cp = checkpointer(store.clone(), InMemoryMetrics::arc());
        cp.save_event(&record("b", 2)).unwrap();
        cp.save_event(&record("a", 1)).unwrap();
        let job = Job::new(JobId::new("a.x.0"), AdapterId::new("x"), EventId::new("a"), "null", JobCommand::default());
        cp.save_job(&job).unwrap();

        let snapshot = cp.load().unwrap();
        let ids: Vec<_> = snapshot.events.iter().map(|r| r.event.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(snapshot.jobs, vec![job]);
        assert_eq!(snapshot.corrupt, 0);
    }

    #[test]
    fn corrupt_records_are_deleted_and_counted() {
        let store = InMemoryCheckpointStore::arc();
        store.put(&CheckpointKey::parse("job:broken").unwrap(), b"{not json").unwrap();
        let cp = checkpointer(store.clone(), InMemoryMetrics::arc());

        let snapshot = cp.load().unwrap();
        assert_eq!(snapshot.corrupt, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn transient_write_failures_are_retried() {
        let store = InMemoryCheckpointStore::arc();
        let metrics = InMemoryMetrics::arc();
        let cp = checkpointer(store.clone(), metrics.clone());

        store.fail_next_writes(2);
        cp.save_event(&record("a", 0)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(metrics.counter(names::CHECKPOINT_RETRY), 2);

        store.fail_next_writes(10);
        assert!(matches!(cp.remove_event(&EventId::new("a")), Err(CheckpointError::Unavailable(_))));
    }
}
