//! Job state machine with write-ahead checkpointing.
//!
//! Every transition is computed on a copy of the job, checkpointed, and only
//! then installed in the [`JobTable`]. A failed checkpoint write leaves the
//! in-memory job untouched. Transitions on one job are serialized by the job's
//! own mutex; different jobs never contend.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use eva_core::{EventId, JobId};
use eva_observability::{metrics::names, MetricsSink};

use super::table::{JobStats, JobTable};
use super::types::{FailureKind, InvalidTransition, Job, JobFailure, JobOutput, JobStatus};
use crate::adapter::{Adapter, RetryDecision};
use crate::checkpoint::{CheckpointError, Checkpointer};
use crate::dispatch::{Completion, ExecOutcome};

#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {0} is running")]
    Busy(JobId),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("job state poisoned: {0}")]
    Poisoned(JobId),
}

impl LifecycleError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Checkpoint(e) if e.is_recoverable())
    }
}

/// Why a failed job will not run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// Retry ceiling reached
    Exhausted,
    /// The owning adapter declined the retry
    Declined,
}

/// What happened to a FAILED job after the retry decision.
#[derive(Debug, Clone, PartialEq)]
pub enum JobDisposition {
    Requeued { retry_count: u32, delay: Duration },
    GaveUp(GiveUpReason),
}

pub struct JobLifecycleManager {
    table: Arc<JobTable>,
    checkpointer: Checkpointer,
    metrics: Arc<dyn MetricsSink>,
}

impl JobLifecycleManager {
    pub fn new(table: Arc<JobTable>, checkpointer: Checkpointer, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            table,
            checkpointer,
            metrics,
        }
    }

    pub fn table(&self) -> &Arc<JobTable> {
        &self.table
    }

    pub fn stats(&self) -> JobStats {
        self.table.stats()
    }

    /// Register a new INITIALIZED job. Creating a job whose id already exists
    /// is a no-op and returns `false`.
    pub fn create(&self, job: Job) -> Result<bool, LifecycleError> {
        if self.table.contains(&job.id) {
            return Ok(false);
        }
        self.checkpointer.save_job(&job)?;
        let adapter = job.adapter_id.clone();
        let inserted = self.table.insert_if_absent(job);
        if inserted {
            self.metrics.incr(names::JOB_CREATED, &[("adapter", adapter.as_str())]);
            self.count_status(JobStatus::Initialized, adapter.as_str());
        }
        Ok(inserted)
    }

    /// INITIALIZED -> STARTED.
    pub fn start(&self, id: &JobId, at: DateTime<Utc>) -> Result<Job, LifecycleError> {
        self.transition(id, |job| job.mark_started(at))
    }

    /// Undo a start whose submission never reached the backend.
    pub fn unstart(&self, id: &JobId, at: DateTime<Utc>) -> Result<Job, LifecycleError> {
        self.transition(id, |job| job.reset_interrupted(at))
    }

    /// STARTED -> COMPLETE or FAILED from a backend report.
    pub fn finish(&self, completion: &Completion) -> Result<Job, LifecycleError> {
        let at = completion.finished_at;
        let output = completion.output.clone();
        match &completion.outcome {
            ExecOutcome::Exited(0) => self.transition(&completion.handle.job_id, |job| job.mark_complete(output, at)),
            ExecOutcome::Exited(code) => {
                let failure = JobFailure {
                    kind: FailureKind::Fatal,
                    reason: format!("exit code {code}"),
                };
                self.fail(&completion.handle.job_id, failure, output, at)
            }
            ExecOutcome::Recoverable(reason) => {
                let failure = JobFailure {
                    kind: FailureKind::Recoverable,
                    reason: reason.clone(),
                };
                self.fail(&completion.handle.job_id, failure, output, at)
            }
        }
    }

    /// STARTED -> FAILED.
    pub fn fail(
        &self,
        id: &JobId,
        failure: JobFailure,
        output: JobOutput,
        at: DateTime<Utc>,
    ) -> Result<Job, LifecycleError> {
        self.transition(id, |job| job.mark_failed(failure, output, at))
    }

    /// Apply the retry decision to a FAILED job.
    ///
    /// Recoverable failures are retried without consulting the adapter; other
    /// failures ask the adapter. Either way the adapter's retry ceiling is
    /// never exceeded. A job that gives up stays FAILED and is left for the
    /// caller to evict.
    pub fn decide(&self, id: &JobId, adapter: &dyn Adapter, at: DateTime<Utc>) -> Result<JobDisposition, LifecycleError> {
        let job = self.table.get_cloned(id).ok_or_else(|| LifecycleError::NotFound(id.clone()))?;
        if job.status != JobStatus::Failed {
            return Err(InvalidTransition {
                job_id: id.clone(),
                from: job.status,
                to: JobStatus::Initialized,
            }
            .into());
        }

        let policy = &adapter.settings().retry;
        let tags = [("adapter", job.adapter_id.as_str())];
        if !policy.should_retry(job.retry_count) {
            info!(job_id = %id, retries = job.retry_count, "retry budget exhausted");
            self.metrics.incr(names::JOB_RETRY_EXHAUSTED, &tags);
            return Ok(JobDisposition::GaveUp(GiveUpReason::Exhausted));
        }

        let recoverable = job.failure.as_ref().is_some_and(|f| f.kind == FailureKind::Recoverable);
        if !recoverable && adapter.decide_retry(&job) == RetryDecision::Decline {
            info!(job_id = %id, exit_code = ?job.exit_code(), "adapter declined retry");
            self.metrics.incr(names::JOB_REQUEUE_REJECTED, &tags);
            return Ok(JobDisposition::GaveUp(GiveUpReason::Declined));
        }

        let delay = policy.delay_for_attempt(job.retry_count + 1);
        let requeued = self.transition(id, |job| job.requeue(delay, at))?;
        info!(
            job_id = %id,
            retry_count = requeued.retry_count,
            delay_ms = delay.as_millis() as u64,
            recoverable,
            "job requeued"
        );
        self.metrics.incr(names::JOB_REQUEUED, &tags);
        Ok(JobDisposition::Requeued {
            retry_count: requeued.retry_count,
            delay,
        })
    }

    /// Drop a terminal job: checkpoint first, then memory.
    pub fn evict(&self, id: &JobId) -> Result<Option<Job>, LifecycleError> {
        let Some(cell) = self.table.get(id) else {
            return Ok(None);
        };
        let job = cell.lock().map_err(|_| LifecycleError::Poisoned(id.clone()))?;
        if !matches!(job.status, JobStatus::Complete | JobStatus::Failed) {
            return Err(LifecycleError::Busy(id.clone()));
        }
        self.checkpointer.remove_job(id)?;
        self.table.remove(id);
        debug!(job_id = %id, status = %job.status, "job evicted");
        Ok(Some(job.clone()))
    }

    /// Administrative removal of a job that is not running.
    pub fn abort(&self, id: &JobId) -> Result<Job, LifecycleError> {
        let cell = self.table.get(id).ok_or_else(|| LifecycleError::NotFound(id.clone()))?;
        let job = cell.lock().map_err(|_| LifecycleError::Poisoned(id.clone()))?;
        if job.status == JobStatus::Started {
            return Err(LifecycleError::Busy(id.clone()));
        }
        self.checkpointer.remove_job(id)?;
        self.table.remove(id);
        warn!(job_id = %id, status = %job.status, "job deleted by operator");
        Ok(job.clone())
    }

    /// Install a job read back from the checkpoint store. A job found STARTED
    /// was interrupted by the restart and goes back to INITIALIZED with its
    /// retry count unchanged. Restoring the same job twice is an upsert.
    pub fn restore(&self, mut job: Job, at: DateTime<Utc>) -> Result<Job, LifecycleError> {
        if job.status == JobStatus::Started {
            job.reset_interrupted(at)?;
            self.checkpointer.save_job(&job)?;
            info!(job_id = %job.id, "interrupted job reset for redispatch");
        }
        self.table.upsert(job.clone());
        Ok(job)
    }

    pub fn jobs_for_event(&self, event_id: &EventId) -> Vec<Job> {
        self.table.by_event(event_id)
    }

    fn transition(
        &self,
        id: &JobId,
        apply: impl FnOnce(&mut Job) -> Result<(), InvalidTransition>,
    ) -> Result<Job, LifecycleError> {
        let cell = self.table.get(id).ok_or_else(|| LifecycleError::NotFound(id.clone()))?;
        let mut current = cell.lock().map_err(|_| LifecycleError::Poisoned(id.clone()))?;
        // Removed while we waited for the lock.
        if !self.table.contains(id) {
            return Err(LifecycleError::NotFound(id.clone()));
        }

        let mut next = current.clone();
        apply(&mut next)?;
        self.checkpointer.save_job(&next)?;
        *current = next.clone();
        drop(current);

        debug!(job_id = %id, status = %next.status, retry_count = next.retry_count, "job transition");
        self.count_status(next.status, next.adapter_id.as_str());
        Ok(next)
    }

    fn count_status(&self, status: JobStatus, adapter: &str) {
        self.metrics
            .incr(names::JOB_STATUS, &[("status", status.as_str()), ("adapter", adapter)]);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use eva_core::AdapterId;
    use eva_observability::InMemoryMetrics;

    use super::*;
    use crate::adapter::{AdapterError, AdapterSettings, Evaluation};
    use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
    use crate::dispatch::SubmissionHandle;
    use crate::jobs::{JobCommand, RetryPolicy};
    use eva_events::{Event, ResourceDescriptor};

    struct Fixed {
        settings: AdapterSettings,
        decision: RetryDecision,
    }

    impl Adapter for Fixed {
        fn settings(&self) -> &AdapterSettings {
            &self.settings
        }

        fn evaluate(&self, _: &Event, _: Option<&ResourceDescriptor>) -> Result<Evaluation, AdapterError> {
            Ok(Evaluation::reject("unused"))
        }

        fn decide_retry(&self, _: &Job) -> RetryDecision {
            self.decision
        }
    }

    fn adapter(max_retries: u32, decision: RetryDecision) -> Fixed {
        Fixed {
            settings: AdapterSettings::new("a", "null").with_retry(RetryPolicy::fixed(max_retries, Duration::ZERO)),
            decision,
        }
    }

    fn manager() -> (JobLifecycleManager, Arc<InMemoryCheckpointStore>, Arc<InMemoryMetrics>) {
        let store = InMemoryCheckpointStore::arc();
        let metrics = InMemoryMetrics::arc();
        let checkpointer = Checkpointer::new(store.clone(), RetryPolicy::no_retry(), metrics.clone());
        let manager = JobLifecycleManager::new(Arc::new(JobTable::new()), checkpointer, metrics.clone());
        (manager, store, metrics)
    }

    fn new_job() -> Job {
        Job::new(JobId::new("e.a.0"), AdapterId::new("a"), EventId::new("e"), "null", JobCommand::script("false"))
    }

    fn exited(code: i32) -> Completion {
        let handle = SubmissionHandle {
            backend: "null".to_string(),
            job_id: JobId::new("e.a.0"),
        };
        Completion::new(handle, ExecOutcome::Exited(code), JobOutput { exit_code: Some(code), ..Default::default() })
    }

    fn run_and_fail(manager: &JobLifecycleManager, code: i32) {
        manager.start(&JobId::new("e.a.0"), Utc::now()).unwrap();
        manager.finish(&exited(code)).unwrap();
    }

    #[test]
    fn create_checkpoints_and_is_idempotent() {
        let (manager, store, metrics) = manager();
        assert!(manager.create(new_job()).unwrap());
        assert!(!manager.create(new_job()).unwrap());
        assert_eq!(store.keys(), vec!["job:e.a.0".to_string()]);
        assert_eq!(metrics.counter(names::JOB_CREATED), 1);
    }

    #[test]
    fn failed_checkpoint_leaves_job_unchanged() {
        let (manager, store, _) = manager();
        manager.create(new_job()).unwrap();
        store.fail_next_writes(1);

        assert!(manager.start(&JobId::new("e.a.0"), Utc::now()).is_err());
        let job = manager.table().get_cloned(&JobId::new("e.a.0")).unwrap();
        assert_eq!(job.status, JobStatus::Initialized);
    }

    #[test]
    fn successful_run_completes() {
        let (manager, store, _) = manager();
        manager.create(new_job()).unwrap();
        manager.start(&JobId::new("e.a.0"), Utc::now()).unwrap();
        let job = manager.finish(&exited(0)).unwrap();
        assert_eq!(job.status, JobStatus::Complete);

        manager.evict(&job.id).unwrap();
        assert!(manager.table().is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn retry_count_increases_until_ceiling() {
        let (manager, _, metrics) = manager();
        let adapter = adapter(2, RetryDecision::Retry);
        manager.create(new_job()).unwrap();
        let id = JobId::new("e.a.0");

        let mut seen = Vec::new();
        loop {
            run_and_fail(&manager, 1);
            match manager.decide(&id, &adapter, Utc::now()).unwrap() {
                JobDisposition::Requeued { retry_count, .. } => seen.push(retry_count),
                JobDisposition::GaveUp(reason) => {
                    assert_eq!(reason, GiveUpReason::Exhausted);
                    break;
                }
            }
        }
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(metrics.counter(names::JOB_REQUEUED), 2);
        assert_eq!(metrics.counter(names::JOB_RETRY_EXHAUSTED), 1);
    }

    #[test]
    fn adapter_can_decline_retry() {
        let (manager, _, metrics) = manager();
        manager.create(new_job()).unwrap();
        run_and_fail(&manager, 1);

        let disposition = manager
            .decide(&JobId::new("e.a.0"), &adapter(5, RetryDecision::Decline), Utc::now())
            .unwrap();
        assert_eq!(disposition, JobDisposition::GaveUp(GiveUpReason::Declined));
        assert_eq!(metrics.counter(names::JOB_REQUEUE_REJECTED), 1);
    }

    #[test]
    fn recoverable_failures_retry_regardless_of_adapter() {
        let (manager, _, _) = manager();
        manager.create(new_job()).unwrap();
        let id = JobId::new("e.a.0");
        manager.start(&id, Utc::now()).unwrap();
        let lost = Completion::new(
            SubmissionHandle {
                backend: "null".to_string(),
                job_id: id.clone(),
            },
            ExecOutcome::Recoverable("connection reset".to_string()),
            JobOutput::default(),
        );
        manager.finish(&lost).unwrap();

        let disposition = manager.decide(&id, &adapter(1, RetryDecision::Decline), Utc::now()).unwrap();
        assert!(matches!(disposition, JobDisposition::Requeued { retry_count: 1, .. }));
    }

    #[test]
    fn restore_resets_started_jobs_and_is_idempotent() {
        let (manager, store, _) = manager();
        let mut job = new_job();
        job.mark_started(Utc::now()).unwrap();

        manager.restore(job.clone(), Utc::now()).unwrap();
        manager.restore(job, Utc::now()).unwrap();

        assert_eq!(manager.table().len(), 1);
        let restored = manager.table().get_cloned(&JobId::new("e.a.0")).unwrap();
        assert_eq!(restored.status, JobStatus::Initialized);
        assert_eq!(restored.retry_count, 0);
        assert!(store.get(&crate::checkpoint::CheckpointKey::job(&restored.id)).unwrap().is_some());
    }

    #[test]
    fn running_jobs_cannot_be_aborted() {
        let (manager, _, _) = manager();
        manager.create(new_job()).unwrap();
        let id = JobId::new("e.a.0");
        manager.start(&id, Utc::now()).unwrap();
        assert!(matches!(manager.abort(&id), Err(LifecycleError::Busy(_))));
        assert!(matches!(manager.evict(&id), Err(LifecycleError::Busy(_))));
    }
}
