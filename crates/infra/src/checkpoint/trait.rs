use std::sync::Arc;

use thiserror::Error;

use eva_core::{EventId, JobId};

/// Record family; doubles as the key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointKind {
    Event,
    Job,
}

impl CheckpointKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            CheckpointKind::Event => "event:",
            CheckpointKind::Job => "job:",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointKind::Event => "event",
            CheckpointKind::Job => "job",
        }
    }
}

/// `event:<id>` / `job:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointKey(String);

impl CheckpointKey {
    pub fn event(id: &EventId) -> Self {
        Self(format!("{}{}", CheckpointKind::Event.prefix(), id))
    }

    pub fn job(id: &JobId) -> Self {
        Self(format!("{}{}", CheckpointKind::Job.prefix(), id))
    }

    /// Parse a stored key; unknown prefixes are rejected.
    pub fn parse(raw: &str) -> Result<Self, CheckpointError> {
        if raw.starts_with(CheckpointKind::Event.prefix()) || raw.starts_with(CheckpointKind::Job.prefix()) {
            Ok(Self(raw.to_string()))
        } else {
            Err(CheckpointError::InvalidKey(raw.to_string()))
        }
    }

    pub fn kind(&self) -> CheckpointKind {
        if self.0.starts_with(CheckpointKind::Event.prefix()) {
            CheckpointKind::Event
        } else {
            CheckpointKind::Job
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Error)]
pub enum CheckpointError {
    /// The backing store cannot be reached right now.
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),

    #[error("checkpoint storage error: {0}")]
    Storage(String),

    #[error("invalid checkpoint key: {0}")]
    InvalidKey(String),

    #[error("checkpoint encoding failed: {0}")]
    Encode(String),
}

impl CheckpointError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Durable keyed store with read-your-writes semantics.
pub trait CheckpointStore: Send + Sync {
    /// Insert or overwrite a record.
    fn put(&self, key: &CheckpointKey, value: &[u8]) -> Result<(), CheckpointError>;

    fn get(&self, key: &CheckpointKey) -> Result<Option<Vec<u8>>, CheckpointError>;

    /// Remove a record; removing a missing key is not an error.
    fn delete(&self, key: &CheckpointKey) -> Result<(), CheckpointError>;

    /// All records of one kind, in key order.
    fn list_by_prefix(&self, kind: CheckpointKind) -> Result<Vec<(CheckpointKey, Vec<u8>)>, CheckpointError>;
}

impl<S> CheckpointStore for Arc<S>
where
    S: CheckpointStore + ?Sized,
{
    fn put(&self, key: &CheckpointKey, value: &[u8]) -> Result<(), CheckpointError> {
        (**self).put(key, value)
    }

    fn get(&self, key: &CheckpointKey) -> Result<Option<Vec<u8>>, CheckpointError> {
        (**self).get(key)
    }

    fn delete(&self, key: &CheckpointKey) -> Result<(), CheckpointError> {
        (**self).delete(key)
    }

    fn list_by_prefix(&self, kind: CheckpointKind) -> Result<Vec<(CheckpointKey, Vec<u8>)>, CheckpointError> {
        (**self).list_by_prefix(kind)
    }
}
