//! Execution backend contract.

use std::sync::{mpsc, Arc};

use chrono::{DateTime, Utc};
use thiserror::Error;

use eva_core::JobId;

use crate::jobs::{JobCommand, JobOutput};

/// Work handed to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job_id: JobId,
    pub command: JobCommand,
}

/// Identifies one accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionHandle {
    pub backend: String,
    pub job_id: JobId,
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The command ran to completion with this exit code
    Exited(i32),
    /// The backend lost the job (connectivity, host failure); the command's
    /// own result is unknown
    Recoverable(String),
}

/// Asynchronous completion report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub handle: SubmissionHandle,
    pub outcome: ExecOutcome,
    pub output: JobOutput,
    pub finished_at: DateTime<Utc>,
}

impl Completion {
    pub fn new(handle: SubmissionHandle, outcome: ExecOutcome, output: JobOutput) -> Self {
        Self {
            handle,
            outcome,
            output,
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ExecOutcome::Exited(0)
    }
}

pub type CompletionSender = mpsc::Sender<Completion>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend cannot take work right now; the job is not started.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend refused this particular command.
    #[error("submission rejected: {0}")]
    Rejected(String),
}

impl BackendError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A facility that runs job commands.
///
/// `submit` must not block on the command itself: the outcome is delivered
/// later through `completions`, exactly once per accepted submission.
pub trait ExecutionBackend: Send + Sync {
    fn id(&self) -> &str;

    fn submit(&self, submission: Submission, completions: CompletionSender) -> Result<SubmissionHandle, BackendError>;
}

impl<B> ExecutionBackend for Arc<B>
where
    B: ExecutionBackend + ?Sized,
{
    fn id(&self) -> &str {
        (**self).id()
    }

    fn submit(&self, submission: Submission, completions: CompletionSender) -> Result<SubmissionHandle, BackendError> {
        (**self).submit(submission, completions)
    }
}
