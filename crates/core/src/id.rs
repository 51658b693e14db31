//! Strongly-typed identifiers used across the scheduler.
//!
//! Event identifiers are assigned by the upstream producer, adapter identifiers
//! come from configuration section names, and job identifiers are derived from
//! both so that re-matching the same event after a crash yields the same key.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EvaError;

/// Identifier of an event (source-provided, or generated for local events).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

/// Identifier of a configured adapter instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdapterId(String);

/// Identifier of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = EvaError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Err(EvaError::configuration(format!(
                        "{}: identifier must not be empty",
                        $name
                    )));
                }
                Ok(Self(trimmed.to_string()))
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_string_newtype!(EventId, "EventId");
impl_string_newtype!(AdapterId, "AdapterId");
impl_string_newtype!(JobId, "JobId");

impl EventId {
    /// Wrap a producer-assigned identifier without validation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate an identifier for an event that originates inside this process.
    ///
    /// Uses UUIDv7 (time-ordered) so generated ids never collide with each other.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl AdapterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Deterministic job id for the `index`-th job request an adapter produced
    /// for an event.
    pub fn derive(event: &EventId, adapter: &AdapterId, index: usize) -> Self {
        Self(format!("{}.{}.{}", event.0, adapter.0, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_job_ids_are_stable() {
        let event = EventId::new("e-1");
        let adapter = AdapterId::new("convert");

        assert_eq!(JobId::derive(&event, &adapter, 0).as_str(), "e-1.convert.0");
        assert_eq!(
            JobId::derive(&event, &adapter, 3),
            JobId::derive(&event, &adapter, 3)
        );
        assert_ne!(
            JobId::derive(&event, &adapter, 0),
            JobId::derive(&event, &adapter, 1)
        );
    }

    #[test]
    fn generated_event_ids_are_unique() {
        assert_ne!(EventId::generate(), EventId::generate());
    }

    #[test]
    fn parsing_rejects_blank_identifiers() {
        assert!(AdapterId::from_str("  ").is_err());
        assert_eq!(AdapterId::from_str(" a ").unwrap().as_str(), "a");
    }
}
