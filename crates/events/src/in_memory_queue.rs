//! In-memory message queue for tests/dev.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::message_queue::{MessageQueue, MessageQueueError};
use crate::record::{Position, RawRecord};

#[derive(Debug, Default)]
struct QueueState {
    next_offset: u64,
    pending: VecDeque<RawRecord>,
    committed: Vec<Position>,
    failing_commits: usize,
    connected: bool,
    closed: bool,
}

/// In-memory queue with numeric offsets.
///
/// - No IO
/// - Commits are recorded so tests can assert what was acknowledged
/// - Commit failures and disconnects can be injected
#[derive(Debug)]
pub struct InMemoryMessageQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, MessageQueueError> {
        self.state
            .lock()
            .map_err(|_| MessageQueueError::Disconnected("lock poisoned".to_string()))
    }

    /// Append a record body; returns the position assigned to it.
    pub fn publish(&self, body: impl Into<Vec<u8>>) -> Result<Position, MessageQueueError> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(MessageQueueError::Closed);
        }
        let position = Position::new(state.next_offset.to_string());
        state.next_offset += 1;
        state.pending.push_back(RawRecord::new(position.clone(), body));
        drop(state);
        self.available.notify_one();
        Ok(position)
    }

    /// Serialize `value` as JSON and publish it.
    pub fn publish_json(&self, value: &serde_json::Value) -> Result<Position, MessageQueueError> {
        let body = serde_json::to_vec(value)
            .map_err(|e| MessageQueueError::Disconnected(format!("encode failed: {e}")))?;
        self.publish(body)
    }

    /// Positions committed so far, in commit order.
    pub fn committed(&self) -> Vec<Position> {
        self.lock().map(|s| s.committed.clone()).unwrap_or_default()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().map(|s| s.pending.len()).unwrap_or(0)
    }

    /// Make the next `n` commits fail with a recoverable error.
    pub fn fail_next_commits(&self, n: usize) {
        if let Ok(mut s) = self.lock() {
            s.failing_commits = n;
        }
    }

    pub fn set_connected(&self, connected: bool) {
        if let Ok(mut s) = self.lock() {
            s.connected = connected;
        }
    }

    pub fn close(&self) {
        if let Ok(mut s) = self.lock() {
            s.closed = true;
        }
        self.available.notify_all();
    }
}

impl Default for InMemoryMessageQueue {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState {
                connected: true,
                ..QueueState::default()
            }),
            available: Condvar::new(),
        }
    }
}

impl MessageQueue for InMemoryMessageQueue {
    fn pull(&self, timeout: Duration) -> Result<Option<RawRecord>, MessageQueueError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock()?;
        loop {
            if !state.connected {
                return Err(MessageQueueError::Disconnected("queue offline".to_string()));
            }
            if let Some(record) = state.pending.pop_front() {
                return Ok(Some(record));
            }
            if state.closed {
                return Err(MessageQueueError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .map_err(|_| MessageQueueError::Disconnected("lock poisoned".to_string()))?;
            state = guard;
        }
    }

    fn commit(&self, position: &Position) -> Result<(), MessageQueueError> {
        let mut state = self.lock()?;
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(MessageQueueError::Commit(format!("injected failure at {position}")));
        }
        state.committed.push(position.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().map(|s| s.connected).unwrap_or(false)
    }

    fn reconnect(&self) -> Result<(), MessageQueueError> {
        let state = self.lock()?;
        if state.connected {
            Ok(())
        } else {
            Err(MessageQueueError::Disconnected("queue offline".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_returns_records_in_publish_order() {
        let queue = InMemoryMessageQueue::new();
        queue.publish(b"a".to_vec()).unwrap();
        queue.publish(b"b".to_vec()).unwrap();

        let first = queue.pull(Duration::from_millis(1)).unwrap().unwrap();
        let second = queue.pull(Duration::from_millis(1)).unwrap().unwrap();
        assert_eq!(first.body, b"a");
        assert_eq!(second.position.as_str(), "1");
        assert!(queue.pull(Duration::from_millis(1)).unwrap().is_none());
    }

    #[test]
    fn injected_commit_failures_are_recoverable() {
        let queue = InMemoryMessageQueue::new();
        let pos = queue.publish(b"a".to_vec()).unwrap();
        queue.fail_next_commits(1);

        let err = queue.commit(&pos).unwrap_err();
        assert!(err.is_recoverable());
        queue.commit(&pos).unwrap();
        assert_eq!(queue.committed(), vec![pos]);
    }

    #[test]
    fn disconnected_queue_reports_error() {
        let queue = InMemoryMessageQueue::new();
        queue.set_connected(false);
        assert!(!queue.is_connected());
        assert!(queue.pull(Duration::from_millis(1)).is_err());
        assert!(queue.reconnect().is_err());
    }
}
