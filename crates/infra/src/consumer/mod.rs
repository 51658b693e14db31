//! Broker-backed [`eva_events::MessageQueue`] clients.

pub mod redis_streams;

pub use redis_streams::{RedisStreamsQueue, RedisStreamsQueueConfig};
