//! Normalized notification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use eva_core::{AdapterId, EventId};

use crate::resource::ResourceRef;

/// `major.minor.patch` protocol version carried by every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    /// The only major version this scheduler understands.
    pub const SUPPORTED_MAJOR: u32 = 1;

    pub const CURRENT: Self = Self {
        major: 1,
        minor: 0,
        patch: 0,
    };

    pub fn is_supported(&self) -> bool {
        self.major == Self::SUPPORTED_MAJOR
    }
}

impl core::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl core::str::FromStr for ProtocolVersion {
    type Err = String;

    /// Accepts `1`, `1.2` or `1.2.3`; missing components default to zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let mut next = |name: &str, required: bool| -> Result<u32, String> {
            match parts.next() {
                Some(p) => p
                    .parse::<u32>()
                    .map_err(|e| format!("invalid {name} component '{p}': {e}")),
                None if required => Err(format!("missing {name} component")),
                None => Ok(0),
            }
        };
        let major = next("major", true)?;
        let minor = next("minor", false)?;
        let patch = next("patch", false)?;
        if parts.next().is_some() {
            return Err(format!("too many components in '{s}'"));
        }
        Ok(Self { major, minor, patch })
    }
}

/// Producing instance a resource belongs to. Events sharing a `group` are
/// ordered among themselves by `reference_time` under the adaptive policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceRef {
    pub group: String,
    pub reference_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    ResourceUpdated {
        reference: ResourceRef,
        /// Version the producer saw; `None` skips the version check.
        object_version: Option<u64>,
    },
    ResourceExpired {
        reference: ResourceRef,
        object_version: Option<u64>,
    },
    Heartbeat,
}

/// A normalized notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    /// Creation/reference timestamp used for age checks and ordering.
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub instance: Option<InstanceRef>,
    /// When non-empty, only these adapters are offered the event.
    #[serde(default)]
    pub target_adapters: Vec<AdapterId>,
}

impl Event {
    pub fn new(id: EventId, timestamp: DateTime<Utc>, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp,
            payload,
            protocol_version: ProtocolVersion::CURRENT,
            instance: None,
            target_adapters: Vec::new(),
        }
    }

    /// Event created inside this process (manual injection), with a generated id.
    pub fn local(reference: ResourceRef, target_adapters: Vec<AdapterId>) -> Self {
        let mut event = Self::new(
            EventId::generate(),
            Utc::now(),
            EventPayload::ResourceUpdated {
                reference,
                object_version: None,
            },
        );
        event.target_adapters = target_adapters;
        event
    }

    pub fn with_instance(mut self, group: impl Into<String>, reference_time: DateTime<Utc>) -> Self {
        self.instance = Some(InstanceRef {
            group: group.into(),
            reference_time,
        });
        self
    }

    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.payload, EventPayload::Heartbeat)
    }

    pub fn resource(&self) -> Option<&ResourceRef> {
        match &self.payload {
            EventPayload::ResourceUpdated { reference, .. }
            | EventPayload::ResourceExpired { reference, .. } => Some(reference),
            EventPayload::Heartbeat => None,
        }
    }

    pub fn object_version(&self) -> Option<u64> {
        match &self.payload {
            EventPayload::ResourceUpdated { object_version, .. }
            | EventPayload::ResourceExpired { object_version, .. } => *object_version,
            EventPayload::Heartbeat => None,
        }
    }

    pub fn is_expiry(&self) -> bool {
        matches!(self.payload, EventPayload::ResourceExpired { .. })
    }

    /// Whether `adapter` may be offered this event.
    pub fn targets(&self, adapter: &AdapterId) -> bool {
        self.target_adapters.is_empty() || self.target_adapters.contains(adapter)
    }

    pub fn type_name(&self) -> &'static str {
        match self.payload {
            EventPayload::ResourceUpdated { .. } => "resource_updated",
            EventPayload::ResourceExpired { .. } => "resource_expired",
            EventPayload::Heartbeat => "heartbeat",
        }
    }
}

impl core::fmt::Display for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.resource() {
            Some(r) => write!(f, "{}[{} {}]", self.id, self.type_name(), r),
            None => write!(f, "{}[{}]", self.id, self.type_name()),
        }
    }
}
