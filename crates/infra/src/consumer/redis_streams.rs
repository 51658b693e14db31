//! Redis Streams message queue (consumer-group based, at-least-once).
//!
//! - **Stream key**: `eva:events` unless configured otherwise
//! - **Record body**: the `payload` field of each stream entry
//! - **Position**: the stream entry id; committing sends `XACK`
//!
//! Entries delivered to this consumer but never acknowledged (for example
//! before a crash) are read again first, so nothing admitted-but-uncommitted
//! is lost across restarts.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use redis::streams::StreamReadReply;
use tracing::{debug, info, instrument, warn};

use eva_events::{MessageQueue, MessageQueueError, Position, RawRecord};

const DEFAULT_STREAM_KEY: &str = "eva:events";
const DEFAULT_GROUP: &str = "eva";
const PAYLOAD_FIELD: &str = "payload";

#[derive(Debug, Clone)]
pub struct RedisStreamsQueueConfig {
    pub url: String,
    pub stream_key: String,
    pub group: String,
    pub consumer: String,
}

impl RedisStreamsQueueConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: "eva-1".to_string(),
        }
    }

    pub fn with_stream_key(mut self, key: impl Into<String>) -> Self {
        self.stream_key = key.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    /// `EVA_REDIS_STREAM`, `EVA_REDIS_GROUP` and `EVA_REDIS_CONSUMER`
    /// override the defaults.
    pub fn from_env(url: impl Into<String>) -> Self {
        let mut config = Self::new(url);
        if let Ok(key) = std::env::var("EVA_REDIS_STREAM") {
            config.stream_key = key;
        }
        if let Ok(group) = std::env::var("EVA_REDIS_GROUP") {
            config.group = group;
        }
        if let Ok(consumer) = std::env::var("EVA_REDIS_CONSUMER") {
            config.consumer = consumer;
        }
        config
    }
}

struct ConsumerState {
    conn: Option<redis::Connection>,
    /// Cursor into this consumer's pending list; `None` once it is drained
    /// and reads switch to new entries (`>`).
    backlog_cursor: Option<String>,
}

pub struct RedisStreamsQueue {
    client: redis::Client,
    config: RedisStreamsQueueConfig,
    state: Mutex<ConsumerState>,
}

impl core::fmt::Debug for RedisStreamsQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsQueue")
            .field("stream_key", &self.config.stream_key)
            .field("group", &self.config.group)
            .field("consumer", &self.config.consumer)
            .finish()
    }
}

fn disconnected(context: &str, e: impl core::fmt::Display) -> MessageQueueError {
    MessageQueueError::Disconnected(format!("{context}: {e}"))
}

impl RedisStreamsQueue {
    /// Open the client and make sure the consumer group exists.
    pub fn connect(config: RedisStreamsQueueConfig) -> Result<Self, MessageQueueError> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| disconnected("open", e))?;
        let queue = Self {
            client,
            config,
            state: Mutex::new(ConsumerState {
                conn: None,
                backlog_cursor: Some("0".to_string()),
            }),
        };
        queue.reconnect()?;
        info!(
            stream_key = %queue.config.stream_key,
            group = %queue.config.group,
            consumer = %queue.config.consumer,
            "redis streams consumer connected"
        );
        Ok(queue)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ConsumerState>, MessageQueueError> {
        self.state
            .lock()
            .map_err(|_| MessageQueueError::Disconnected("consumer state poisoned".to_string()))
    }

    fn ensure_group(&self, conn: &mut redis::Connection) -> Result<(), MessageQueueError> {
        // BUSYGROUP means it already exists.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(conn);
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(disconnected("XGROUP CREATE", e)),
        }
    }

    fn read(
        &self,
        conn: &mut redis::Connection,
        start: &str,
        block: Option<Duration>,
    ) -> Result<Option<RawRecord>, MessageQueueError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg("COUNT")
            .arg(1);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(&self.config.stream_key).arg(start);

        let reply: Option<StreamReadReply> = cmd.query(conn).map_err(|e| disconnected("XREADGROUP", e))?;
        let Some(entry) = reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|k| k.ids.into_iter().next())
        else {
            return Ok(None);
        };

        // An entry without a payload still gets a position so it can be
        // committed and skipped as malformed downstream.
        let body: Vec<u8> = entry.get(PAYLOAD_FIELD).unwrap_or_default();
        Ok(Some(RawRecord::new(Position::new(entry.id), body)))
    }
}

impl MessageQueue for RedisStreamsQueue {
    #[instrument(skip(self), fields(stream_key = %self.config.stream_key))]
    fn pull(&self, timeout: Duration) -> Result<Option<RawRecord>, MessageQueueError> {
        let mut state = self.lock()?;
        let ConsumerState { conn: slot, backlog_cursor } = &mut *state;
        let Some(conn) = slot.as_mut() else {
            return Err(MessageQueueError::Disconnected("not connected".to_string()));
        };

        let result = match backlog_cursor.clone() {
            Some(cursor) => match self.read(conn, &cursor, None) {
                Ok(Some(record)) => {
                    debug!(position = %record.position, "redelivering unacknowledged entry");
                    *backlog_cursor = Some(record.position.as_str().to_string());
                    Ok(Some(record))
                }
                Ok(None) => {
                    *backlog_cursor = None;
                    self.read(conn, ">", Some(timeout))
                }
                Err(e) => Err(e),
            },
            None => self.read(conn, ">", Some(timeout)),
        };

        if result.is_err() {
            *slot = None;
        }
        result
    }

    fn commit(&self, position: &Position) -> Result<(), MessageQueueError> {
        let mut state = self.lock()?;
        let Some(conn) = state.conn.as_mut() else {
            return Err(MessageQueueError::Commit("not connected".to_string()));
        };
        let _: u64 = redis::cmd("XACK")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(position.as_str())
            .query(conn)
            .map_err(|e| MessageQueueError::Commit(format!("XACK {position}: {e}")))?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().map(|s| s.conn.is_some()).unwrap_or(false)
    }

    fn reconnect(&self) -> Result<(), MessageQueueError> {
        let mut conn = self.client.get_connection().map_err(|e| disconnected("connect", e))?;
        if let Err(e) = redis::cmd("PING").query::<String>(&mut conn) {
            warn!(error = %e, "redis ping failed after connect");
            return Err(disconnected("PING", e));
        }
        self.ensure_group(&mut conn)?;

        let mut state = self.lock()?;
        state.conn = Some(conn);
        state.backlog_cursor = Some("0".to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builders_override_defaults() {
        let config = RedisStreamsQueueConfig::new("redis://localhost:6379")
            .with_stream_key("jobs")
            .with_group("g")
            .with_consumer("c");
        assert_eq!(config.stream_key, "jobs");
        assert_eq!(config.group, "g");
        assert_eq!(config.consumer, "c");
        assert_eq!(RedisStreamsQueueConfig::new("redis://x").stream_key, DEFAULT_STREAM_KEY);
    }
}
