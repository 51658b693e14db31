use std::sync::Arc;

use eva_core::{ConfigSection, EvaResult};

use super::backend::{
    BackendError, Completion, CompletionSender, ExecOutcome, ExecutionBackend, Submission, SubmissionHandle,
};
use crate::jobs::JobOutput;

/// Completes every submission immediately without running anything.
#[derive(Debug, Clone)]
pub struct NullBackend {
    id: String,
    exit_code: i32,
}

impl NullBackend {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            exit_code: 0,
        }
    }

    /// Report this exit code for every job.
    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn from_config(id: &str, section: &ConfigSection<'_>) -> EvaResult<Arc<dyn ExecutionBackend>> {
        let exit_code = section.parse_or::<i32>("exit_code", 0)?;
        Ok(Arc::new(Self::new(id).with_exit_code(exit_code)))
    }
}

impl ExecutionBackend for NullBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn submit(&self, submission: Submission, completions: CompletionSender) -> Result<SubmissionHandle, BackendError> {
        let handle = SubmissionHandle {
            backend: self.id.clone(),
            job_id: submission.job_id,
        };
        let output = JobOutput {
            exit_code: Some(self.exit_code),
            ..Default::default()
        };
        completions
            .send(Completion::new(handle.clone(), ExecOutcome::Exited(self.exit_code), output))
            .map_err(|_| BackendError::Unavailable("completion channel closed".to_string()))?;
        Ok(handle)
    }
}
