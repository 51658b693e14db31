//! Event queue: admission, dedup and policy ordering.

pub mod event_queue;
pub mod ordering;

pub use event_queue::{Admission, EventQueue, EventQueueConfig, EventRecord, EventStage};
pub use ordering::OrderingPolicy;
