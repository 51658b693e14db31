//! Scheduler error taxonomy.

use thiserror::Error;

/// Result type used across the scheduler.
pub type EvaResult<T> = Result<T, EvaError>;

/// Top-level error classification.
///
/// Component errors map into one of these classes so callers can decide
/// between aborting startup, retrying with backoff, counting and moving on,
/// or stopping the process.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvaError {
    /// Invalid or missing configuration. Only raised at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A collaborator is temporarily unavailable; retry with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Expected control flow (duplicate, too old, version conflict).
    #[error("rejected: {0}")]
    Rejected(String),

    /// A persisted record could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Unrecoverable; the process must stop.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl EvaError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether retrying the failed operation may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
