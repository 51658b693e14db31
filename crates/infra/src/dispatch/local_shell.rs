//! Runs job scripts with a local shell on a dedicated thread per job.

use std::process::Command;
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use eva_core::{ConfigSection, EvaResult};

use super::backend::{
    BackendError, Completion, CompletionSender, ExecOutcome, ExecutionBackend, Submission, SubmissionHandle,
};
use crate::jobs::JobOutput;

#[derive(Debug, Clone)]
pub struct LocalShellBackend {
    id: String,
    shell: String,
}

impl LocalShellBackend {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            shell: "sh".to_string(),
        }
    }

    /// Interpreter invoked as `<shell> -c <script>`.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn from_config(id: &str, section: &ConfigSection<'_>) -> EvaResult<Arc<dyn ExecutionBackend>> {
        let mut backend = Self::new(id);
        if let Some(shell) = section.get("shell") {
            backend = backend.with_shell(shell);
        }
        Ok(Arc::new(backend))
    }
}

impl ExecutionBackend for LocalShellBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn submit(&self, submission: Submission, completions: CompletionSender) -> Result<SubmissionHandle, BackendError> {
        let handle = SubmissionHandle {
            backend: self.id.clone(),
            job_id: submission.job_id.clone(),
        };
        let report = handle.clone();
        let shell = self.shell.clone();

        thread::Builder::new()
            .name(format!("eva-job-{}", submission.job_id))
            .spawn(move || {
                let result = Command::new(&shell)
                    .arg("-c")
                    .arg(&submission.command.script)
                    .envs(&submission.command.env)
                    .output();

                let completion = match result {
                    Ok(out) => {
                        // Killed by a signal: no exit code, reported as -1.
                        let code = out.status.code().unwrap_or(-1);
                        debug!(job_id = %report.job_id, exit_code = code, "local job finished");
                        Completion::new(
                            report,
                            ExecOutcome::Exited(code),
                            JobOutput {
                                exit_code: Some(code),
                                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
                            },
                        )
                    }
                    Err(e) => {
                        warn!(job_id = %report.job_id, error = %e, "failed to launch shell");
                        Completion::new(report, ExecOutcome::Recoverable(e.to_string()), JobOutput::default())
                    }
                };
                // The receiver is gone only when the engine is shutting down.
                let _ = completions.send(completion);
            })
            .map_err(|e| BackendError::Unavailable(format!("cannot spawn worker thread: {e}")))?;

        Ok(handle)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use eva_core::JobId;

    use super::*;
    use crate::jobs::JobCommand;

    fn run(script: &str) -> Completion {
        let (tx, rx) = mpsc::channel();
        let backend = LocalShellBackend::new("local");
        let submission = Submission {
            job_id: JobId::new("j"),
            command: JobCommand::script(script).with_env("EVA_TEST_VALUE", "42"),
        };
        backend.submit(submission, tx).unwrap();
        rx.recv_timeout(Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn captures_exit_code_and_output() {
        let completion = run("echo out-$EVA_TEST_VALUE; echo err >&2; exit 3");
        assert_eq!(completion.outcome, ExecOutcome::Exited(3));
        assert_eq!(completion.output.stdout.trim(), "out-42");
        assert_eq!(completion.output.stderr.trim(), "err");
        assert_eq!(completion.handle.backend, "local");
    }

    #[test]
    fn successful_script_is_exit_zero() {
        assert!(run("true").is_success());
    }
}
