//! Core job types and policies.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use eva_core::{AdapterId, EventId, JobId};

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created (or requeued), waiting for dispatch
    Initialized,
    /// Submitted to an execution backend
    Started,
    /// Finished with exit status 0
    Complete,
    /// Finished unsuccessfully; awaiting or past the retry decision
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Initialized => "initialized",
            JobStatus::Started => "started",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Geometric backoff: base * factor^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = never retry)
    pub max_retries: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Growth factor for exponential backoff
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            factor: 1.0,
        }
    }

    /// Create a policy with geometric backoff.
    pub fn exponential(max_retries: u32, base_delay: Duration, factor: f64, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            factor,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = self.factor.max(1.0).powi((attempt - 1) as i32);
                base_ms * exp
            }
            BackoffStrategy::Linear => base_ms * (attempt as f64),
        };

        Duration::from_millis(delay_ms.min(max_ms).max(0.0) as u64)
    }

    /// Check if another retry is allowed after `retries_so_far` retries.
    pub fn should_retry(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }
}

/// Shell command handed to an execution backend.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobCommand {
    /// Script body, executed by the backend's shell
    pub script: String,
    /// Extra environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl JobCommand {
    pub fn script(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// How a failed execution should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Backend-side transient problem; retried automatically within budget
    Recoverable,
    /// The command itself failed; the adapter decides about retrying
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub reason: String,
}

/// Captured result of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Record of one status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: JobStatus,
    pub at: DateTime<Utc>,
}

/// A scheduled unit of work owned by one adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Owning adapter
    pub adapter_id: AdapterId,
    /// Event the job was derived from
    pub event_id: EventId,
    /// Backend the adapter routes this job to
    pub backend: String,
    pub command: JobCommand,
    pub status: JobStatus,
    /// Number of FAILED -> INITIALIZED transitions so far
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be dispatched again
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure: Option<JobFailure>,
    #[serde(default)]
    pub output: Option<JobOutput>,
    /// Status transition timestamps, oldest first
    pub history: Vec<StatusChange>,
}

/// Attempted transition is not allowed from the current status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("job {job_id}: cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

impl Job {
    /// Create a new job in INITIALIZED.
    pub fn new(
        id: JobId,
        adapter_id: AdapterId,
        event_id: EventId,
        backend: impl Into<String>,
        command: JobCommand,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            adapter_id,
            event_id,
            backend: backend.into(),
            command,
            status: JobStatus::Initialized,
            retry_count: 0,
            created_at: now,
            not_before: None,
            failure: None,
            output: None,
            history: vec![StatusChange {
                status: JobStatus::Initialized,
                at: now,
            }],
        }
    }

    fn transition(&mut self, from: JobStatus, to: JobStatus, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if self.status != from {
            return Err(InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.history.push(StatusChange { status: to, at });
        Ok(())
    }

    /// Check if the job may be dispatched at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Initialized && self.not_before.is_none_or(|at| now >= at)
    }

    /// Mark job as submitted to its backend.
    pub fn mark_started(&mut self, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Initialized, JobStatus::Started, at)?;
        self.failure = None;
        self.output = None;
        Ok(())
    }

    /// Mark job as completed.
    pub fn mark_complete(&mut self, output: JobOutput, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Started, JobStatus::Complete, at)?;
        self.output = Some(output);
        Ok(())
    }

    /// Mark job as failed.
    pub fn mark_failed(
        &mut self,
        failure: JobFailure,
        output: JobOutput,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Started, JobStatus::Failed, at)?;
        self.failure = Some(failure);
        self.output = Some(output);
        Ok(())
    }

    /// Put a failed job back to INITIALIZED for another attempt after `delay`.
    pub fn requeue(&mut self, delay: Duration, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Failed, JobStatus::Initialized, at)?;
        self.retry_count += 1;
        self.not_before = Some(at + chrono::Duration::from_std(delay).unwrap_or_default());
        Ok(())
    }

    /// Undo STARTED after the backend that ran it was lost (process restart).
    /// The retry count is unchanged: the attempt never reported an outcome.
    pub fn reset_interrupted(&mut self, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Started, JobStatus::Initialized, at)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.output.as_ref().and_then(|o| o.exit_code)
    }

    /// Time of the most recent change into `status`.
    pub fn last_changed_to(&self, status: JobStatus) -> Option<DateTime<Utc>> {
        self.history.iter().rev().find(|c| c.status == status).map(|c| c.at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            JobId::new("e.a.0"),
            AdapterId::new("a"),
            EventId::new("e"),
            "null",
            JobCommand::script("/bin/true"),
        )
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), 2.0, Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn backoff_respects_ceiling() {
        let policy = RetryPolicy::exponential(20, Duration::from_secs(1), 3.0, Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn should_retry_respects_max_retries() {
        let policy = RetryPolicy {
            max_retries: 2,
            ..Default::default()
        };

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[test]
    fn job_lifecycle() {
        let mut job = job();
        let now = Utc::now();

        job.mark_started(now).unwrap();
        job.mark_complete(
            JobOutput {
                exit_code: Some(0),
                ..Default::default()
            },
            now,
        )
        .unwrap();

        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.exit_code(), Some(0));
        let statuses: Vec<_> = job.history.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Initialized, JobStatus::Started, JobStatus::Complete]
        );
    }

    #[test]
    fn job_failure_and_requeue() {
        let mut job = job();
        let now = Utc::now();

        job.mark_started(now).unwrap();
        job.mark_failed(
            JobFailure {
                kind: FailureKind::Fatal,
                reason: "exit 1".into(),
            },
            JobOutput::default(),
            now,
        )
        .unwrap();
        job.requeue(Duration::from_secs(10), now).unwrap();

        assert_eq!(job.status, JobStatus::Initialized);
        assert_eq!(job.retry_count, 1);
        assert!(!job.is_ready(now));
        assert!(job.is_ready(now + chrono::Duration::seconds(11)));
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut job = job();
        let err = job.mark_complete(JobOutput::default(), Utc::now()).unwrap_err();
        assert_eq!(err.from, JobStatus::Initialized);
        assert_eq!(err.to, JobStatus::Complete);
        assert!(job.requeue(Duration::ZERO, Utc::now()).is_err());
    }

    proptest::proptest! {
        #[test]
        fn exponential_delay_never_shrinks_and_stays_capped(
            base_ms in 1u64..5_000,
            factor in 1.0f64..4.0,
            max_ms in 1u64..60_000,
            attempt in 1u32..30,
        ) {
            let policy = RetryPolicy::exponential(
                30,
                Duration::from_millis(base_ms),
                factor,
                Duration::from_millis(max_ms),
            );
            let current = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);
            proptest::prop_assert!(next >= current);
            proptest::prop_assert!(next <= Duration::from_millis(max_ms));
        }
    }
}
