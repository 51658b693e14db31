//! Raw queue records and normalization into [`Event`]s.
//!
//! Wire format (JSON object):
//!
//! ```text
//! {
//!   "message_id": "…",                 // required, unique per message
//!   "message_timestamp": "RFC 3339",   // required
//!   "version": "1.0.0",                // required, major must be 1
//!   "type": "resource_updated" | "resource_expired" | "heartbeat",
//!   "uri": "…",                        // required unless heartbeat
//!   "object_version": 7,               // optional
//!   "instance": { "group": "…", "reference_time": "RFC 3339" }  // optional
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use eva_core::EventId;

use crate::event::{Event, EventPayload, InstanceRef, ProtocolVersion};
use crate::resource::ResourceRef;

/// Read position in the external queue (offset, stream entry id, …).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(String);

impl Position {
    pub fn new(position: impl Into<String>) -> Self {
        Self(position.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Position {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Undecoded record as pulled from the external queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub position: Position,
    pub body: Vec<u8>,
}

impl RawRecord {
    pub fn new(position: Position, body: impl Into<Vec<u8>>) -> Self {
        Self {
            position,
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("malformed record at {position}: {reason}")]
    Malformed { position: Position, reason: String },

    #[error("event {id} uses unsupported protocol version {version}")]
    UnsupportedVersion { id: EventId, version: ProtocolVersion },
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    message_id: String,
    message_timestamp: DateTime<Utc>,
    version: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    object_version: Option<u64>,
    #[serde(default)]
    instance: Option<InstanceRef>,
}

/// Decode a raw record into an [`Event`].
///
/// Version gating happens here so unsupported messages never reach the queue.
pub fn normalize(record: &RawRecord) -> Result<Event, NormalizeError> {
    let malformed = |reason: String| NormalizeError::Malformed {
        position: record.position.clone(),
        reason,
    };

    let wire: WireMessage =
        serde_json::from_slice(&record.body).map_err(|e| malformed(e.to_string()))?;

    if wire.message_id.trim().is_empty() {
        return Err(malformed("empty message_id".to_string()));
    }
    let id = EventId::new(wire.message_id.trim());

    let version: ProtocolVersion = wire
        .version
        .parse()
        .map_err(|e: String| malformed(format!("version: {e}")))?;
    if !version.is_supported() {
        return Err(NormalizeError::UnsupportedVersion { id, version });
    }

    let reference = || {
        wire.uri
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(ResourceRef::new)
            .ok_or_else(|| malformed(format!("{} message without uri", wire.kind)))
    };

    let payload = match wire.kind.as_str() {
        "heartbeat" => EventPayload::Heartbeat,
        "resource_updated" => EventPayload::ResourceUpdated {
            reference: reference()?,
            object_version: wire.object_version,
        },
        "resource_expired" => EventPayload::ResourceExpired {
            reference: reference()?,
            object_version: wire.object_version,
        },
        other => return Err(malformed(format!("unknown message type '{other}'"))),
    };

    Ok(Event {
        id,
        timestamp: wire.message_timestamp,
        payload,
        protocol_version: version,
        instance: wire.instance,
        target_adapters: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(body: serde_json::Value) -> RawRecord {
        RawRecord::new(Position::new("0"), serde_json::to_vec(&body).unwrap())
    }

    #[test]
    fn normalizes_resource_update() {
        let event = normalize(&record(serde_json::json!({
            "message_id": "m-1",
            "message_timestamp": "2024-01-01T00:00:00Z",
            "version": "1.2.0",
            "type": "resource_updated",
            "uri": "res://a",
            "object_version": 4,
            "instance": {"group": "run-7", "reference_time": "2024-01-01T00:00:00Z"}
        })))
        .unwrap();

        assert_eq!(event.id.as_str(), "m-1");
        assert_eq!(event.resource().unwrap().as_str(), "res://a");
        assert_eq!(event.object_version(), Some(4));
        assert_eq!(event.instance.unwrap().group, "run-7");
    }

    #[test]
    fn heartbeat_needs_no_uri() {
        let event = normalize(&record(serde_json::json!({
            "message_id": "hb",
            "message_timestamp": "2024-01-01T00:00:00Z",
            "version": "1",
            "type": "heartbeat"
        })))
        .unwrap();
        assert!(event.is_heartbeat());
    }

    #[test]
    fn rejects_unsupported_major_version() {
        let err = normalize(&record(serde_json::json!({
            "message_id": "m-2",
            "message_timestamp": "2024-01-01T00:00:00Z",
            "version": "2.0.0",
            "type": "resource_updated",
            "uri": "res://a"
        })))
        .unwrap_err();
        assert!(matches!(err, NormalizeError::UnsupportedVersion { .. }));
    }

    #[test]
    fn rejects_garbage_and_missing_fields() {
        let garbage = RawRecord::new(Position::new("9"), b"not json".to_vec());
        assert!(matches!(normalize(&garbage), Err(NormalizeError::Malformed { .. })));

        let no_uri = record(serde_json::json!({
            "message_id": "m-3",
            "message_timestamp": "2024-01-01T00:00:00Z",
            "version": "1.0.0",
            "type": "resource_expired"
        }));
        assert!(matches!(normalize(&no_uri), Err(NormalizeError::Malformed { .. })));
    }
}
