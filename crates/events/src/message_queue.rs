//! External message-queue client abstraction.
//!
//! The scheduler consumes one sequential stream of raw records. A record's
//! position is committed only after the event it carries is safely
//! checkpointed, so delivery is at-least-once and consumers dedup by event id.

use std::sync::Arc;
use std::time::Duration;

use crate::record::{Position, RawRecord};

#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageQueueError {
    /// Connection to the broker was lost; reconnecting may help.
    #[error("message queue disconnected: {0}")]
    Disconnected(String),

    /// The broker refused the offset commit.
    #[error("offset commit failed: {0}")]
    Commit(String),

    /// The queue has been closed for good.
    #[error("message queue closed")]
    Closed,
}

impl MessageQueueError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

/// Pull-based queue client.
pub trait MessageQueue: Send + Sync {
    /// Block for up to `timeout` waiting for the next record.
    fn pull(&self, timeout: Duration) -> Result<Option<RawRecord>, MessageQueueError>;

    /// Acknowledge everything up to and including `position`.
    fn commit(&self, position: &Position) -> Result<(), MessageQueueError>;

    /// Whether the client currently believes it is connected.
    fn is_connected(&self) -> bool;

    /// Re-establish the broker connection after a recoverable failure.
    fn reconnect(&self) -> Result<(), MessageQueueError> {
        Ok(())
    }
}

impl<Q> MessageQueue for Arc<Q>
where
    Q: MessageQueue + ?Sized,
{
    fn pull(&self, timeout: Duration) -> Result<Option<RawRecord>, MessageQueueError> {
        (**self).pull(timeout)
    }

    fn commit(&self, position: &Position) -> Result<(), MessageQueueError> {
        (**self).commit(position)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn reconnect(&self) -> Result<(), MessageQueueError> {
        (**self).reconnect()
    }
}
