//! Adapters: configured policies that turn events into job requests.
//!
//! Adapters are a closed set of variants constructed at startup from the
//! flat configuration through a table of constructors keyed by the section's
//! `class` value. Every variant shares [`AdapterSettings`] (backend routing,
//! concurrency, retry policy and input filters).

use eva_core::AdapterId;
use eva_events::{Event, ResourceDescriptor};

use crate::jobs::{Job, JobCommand};

pub mod matcher;
pub mod null;
pub mod registry;
pub mod settings;
pub mod shell;
pub mod template;

pub use matcher::{MatchOutcome, Matcher};
pub use null::NullAdapter;
pub use registry::{builtin_constructors, AdapterConstructor, AdapterRegistry};
pub use settings::{AdapterSettings, InputFilters};
pub use shell::ShellAdapter;

/// Request for one job, produced by an accepting adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub command: JobCommand,
}

impl JobRequest {
    pub fn new(command: JobCommand) -> Self {
        Self { command }
    }
}

/// Result of offering an event to an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    Reject(String),
    /// Never empty; see [`Evaluation::accept_all`].
    Accept(Vec<JobRequest>),
}

impl Evaluation {
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject(reason.into())
    }

    pub fn accept(request: JobRequest) -> Self {
        Self::Accept(vec![request])
    }

    /// Accept with several requests; an empty list counts as a rejection.
    pub fn accept_all(requests: Vec<JobRequest>) -> Self {
        if requests.is_empty() {
            Self::Reject("no job requests".to_string())
        } else {
            Self::Accept(requests)
        }
    }
}

/// Adapter verdict on a FAILED job that is still within its retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Decline,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("template error: {0}")]
    Template(String),
}

/// A configured adapter instance.
pub trait Adapter: Send + Sync {
    fn settings(&self) -> &AdapterSettings;

    fn id(&self) -> &AdapterId {
        &self.settings().id
    }

    /// Decide whether `event` produces jobs. `resource` is the resolved
    /// resource for update events and `None` for expiries.
    fn evaluate(&self, event: &Event, resource: Option<&ResourceDescriptor>) -> Result<Evaluation, AdapterError>;

    /// Called once a job reaches COMPLETE; returned resources are persisted
    /// to the metadata store.
    fn on_complete(&self, _job: &Job, _event: &Event) -> Result<Vec<ResourceDescriptor>, AdapterError> {
        Ok(Vec::new())
    }

    /// Called for a FAILED job that still has retry budget.
    fn decide_retry(&self, _job: &Job) -> RetryDecision {
        RetryDecision::Retry
    }
}
