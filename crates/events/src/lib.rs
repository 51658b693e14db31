//! Notification model and the message-queue seam.
//!
//! Raw records pulled from an external queue are normalized into [`Event`]s;
//! everything downstream of normalization only sees the typed model.

pub mod event;
pub mod in_memory_queue;
pub mod message_queue;
pub mod record;
pub mod resource;

pub use event::{Event, EventPayload, InstanceRef, ProtocolVersion};
pub use in_memory_queue::InMemoryMessageQueue;
pub use message_queue::{MessageQueue, MessageQueueError};
pub use record::{normalize, NormalizeError, Position, RawRecord};
pub use resource::{ResourceDescriptor, ResourceRef};
