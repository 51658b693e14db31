//! In-memory table of live jobs.
//!
//! Each job sits behind its own mutex so that transitions of one job never
//! block readers of another; the table lock only guards membership.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use eva_core::{AdapterId, EventId, JobId};

use super::types::{Job, JobStatus};

/// Shared handle to one live job.
pub type JobCell = Arc<Mutex<Job>>;

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub initialized: usize,
    pub started: usize,
    pub complete: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.initialized + self.started + self.complete + self.failed
    }
}

#[derive(Debug, Default)]
pub struct JobTable {
    jobs: RwLock<BTreeMap<JobId, JobCell>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job unless one with the same id exists. Returns whether the
    /// job was inserted.
    pub fn insert_if_absent(&self, job: Job) -> bool {
        let Ok(mut jobs) = self.jobs.write() else {
            return false;
        };
        if jobs.contains_key(&job.id) {
            return false;
        }
        jobs.insert(job.id.clone(), Arc::new(Mutex::new(job)));
        true
    }

    /// Insert or overwrite a job.
    ///
    /// Lock order is always job cell before table, so an existing cell is
    /// updated without holding the table lock.
    pub fn upsert(&self, job: Job) {
        if let Some(cell) = self.get(&job.id) {
            if let Ok(mut current) = cell.lock() {
                *current = job;
            }
            return;
        }
        if let Ok(mut jobs) = self.jobs.write() {
            jobs.entry(job.id.clone()).or_insert_with(|| Arc::new(Mutex::new(job)));
        }
    }

    pub fn get(&self, id: &JobId) -> Option<JobCell> {
        self.jobs.read().ok()?.get(id).cloned()
    }

    /// Copy of a job's current state.
    pub fn get_cloned(&self, id: &JobId) -> Option<Job> {
        let cell = self.get(id)?;
        let job = cell.lock().ok()?;
        Some(job.clone())
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.read().map(|j| j.contains_key(id)).unwrap_or(false)
    }

    pub fn remove(&self, id: &JobId) -> Option<JobCell> {
        self.jobs.write().ok()?.remove(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|j| j.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies of every job, in id order.
    pub fn snapshot(&self) -> Vec<Job> {
        self.cells()
            .into_iter()
            .filter_map(|cell| cell.lock().ok().map(|j| j.clone()))
            .collect()
    }

    /// Jobs derived from one event, in id order.
    pub fn by_event(&self, event_id: &EventId) -> Vec<Job> {
        self.snapshot()
            .into_iter()
            .filter(|j| &j.event_id == event_id)
            .collect()
    }

    pub fn has_jobs_for_event(&self, event_id: &EventId) -> bool {
        self.cells()
            .into_iter()
            .any(|cell| cell.lock().map(|j| &j.event_id == event_id).unwrap_or(false))
    }

    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.cells()
            .into_iter()
            .filter(|cell| cell.lock().map(|j| j.status == status).unwrap_or(false))
            .count()
    }

    pub fn started_count_for_adapter(&self, adapter: &AdapterId) -> usize {
        self.cells()
            .into_iter()
            .filter(|cell| {
                cell.lock()
                    .map(|j| j.status == JobStatus::Started && &j.adapter_id == adapter)
                    .unwrap_or(false)
            })
            .count()
    }

    pub fn stats(&self) -> JobStats {
        let mut stats = JobStats::default();
        for cell in self.cells() {
            let Ok(job) = cell.lock() else { continue };
            match job.status {
                JobStatus::Initialized => stats.initialized += 1,
                JobStatus::Started => stats.started += 1,
                JobStatus::Complete => stats.complete += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    fn cells(&self) -> Vec<JobCell> {
        self.jobs
            .read()
            .map(|j| j.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::jobs::JobCommand;

    fn job(id: &str, event: &str, adapter: &str) -> Job {
        Job::new(
            JobId::new(id),
            AdapterId::new(adapter),
            EventId::new(event),
            "null",
            JobCommand::default(),
        )
    }

    #[test]
    fn insert_if_absent_is_idempotent() {
        let table = JobTable::new();
        assert!(table.insert_if_absent(job("e.a.0", "e", "a")));
        assert!(!table.insert_if_absent(job("e.a.0", "e", "a")));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn stats_and_per_adapter_counts() {
        let table = JobTable::new();
        let mut started = job("e.a.0", "e", "a");
        started.mark_started(Utc::now()).unwrap();
        table.upsert(started);
        table.upsert(job("e.a.1", "e", "a"));
        table.upsert(job("f.b.0", "f", "b"));

        let stats = table.stats();
        assert_eq!(stats.started, 1);
        assert_eq!(stats.initialized, 2);
        assert_eq!(stats.total(), 3);
        assert_eq!(table.started_count_for_adapter(&AdapterId::new("a")), 1);
        assert_eq!(table.started_count_for_adapter(&AdapterId::new("b")), 0);
        assert_eq!(table.by_event(&EventId::new("e")).len(), 2);
    }

    #[test]
    fn upsert_overwrites_existing_cell() {
        let table = JobTable::new();
        table.upsert(job("e.a.0", "e", "a"));
        let cell = table.get(&JobId::new("e.a.0")).unwrap();

        let mut updated = job("e.a.0", "e", "a");
        updated.retry_count = 3;
        table.upsert(updated);

        assert_eq!(cell.lock().unwrap().retry_count, 3);
        assert!(table.remove(&JobId::new("e.a.0")).is_some());
        assert!(!table.has_jobs_for_event(&EventId::new("e")));
    }
}
