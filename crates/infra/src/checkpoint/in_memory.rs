use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use super::r#trait::{CheckpointError, CheckpointKey, CheckpointKind, CheckpointStore};

/// In-memory checkpoint store.
///
/// Intended for tests/dev. Survives an engine restart only if the same
/// instance is handed to the new engine, which is exactly what crash-recovery
/// tests do. Write failures can be injected to exercise the retry path.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    records: RwLock<BTreeMap<String, Vec<u8>>>,
    failing_writes: AtomicUsize,
    writes: AtomicUsize,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `n` writes (put/delete) fail as unavailable.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.records
            .read()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn check_write(&self) -> Result<(), CheckpointError> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(CheckpointError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn put(&self, key: &CheckpointKey, value: &[u8]) -> Result<(), CheckpointError> {
        self.check_write()?;
        let mut records = self
            .records
            .write()
            .map_err(|_| CheckpointError::Storage("lock poisoned".to_string()))?;
        records.insert(key.as_str().to_string(), value.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, key: &CheckpointKey) -> Result<Option<Vec<u8>>, CheckpointError> {
        let records = self
            .records
            .read()
            .map_err(|_| CheckpointError::Storage("lock poisoned".to_string()))?;
        Ok(records.get(key.as_str()).cloned())
    }

    fn delete(&self, key: &CheckpointKey) -> Result<(), CheckpointError> {
        self.check_write()?;
        let mut records = self
            .records
            .write()
            .map_err(|_| CheckpointError::Storage("lock poisoned".to_string()))?;
        records.remove(key.as_str());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn list_by_prefix(&self, kind: CheckpointKind) -> Result<Vec<(CheckpointKey, Vec<u8>)>, CheckpointError> {
        let records = self
            .records
            .read()
            .map_err(|_| CheckpointError::Storage("lock poisoned".to_string()))?;
        records
            .range(kind.prefix().to_string()..)
            .take_while(|(k, _)| k.starts_with(kind.prefix()))
            .map(|(k, v)| Ok((CheckpointKey::parse(k)?, v.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use eva_core::{EventId, JobId};

    use super::*;

    #[test]
    fn put_get_delete() {
        let store = InMemoryCheckpointStore::new();
        let key = CheckpointKey::event(&EventId::new("e1"));

        store.put(&key, b"one").unwrap();
        store.put(&key, b"two").unwrap();
        assert_eq!(store.get(&key).unwrap().as_deref(), Some(&b"two"[..]));

        store.delete(&key).unwrap();
        assert!(store.get(&key).unwrap().is_none());
        store.delete(&key).unwrap();
    }

    #[test]
    fn list_by_prefix_separates_kinds() {
        let store = InMemoryCheckpointStore::new();
        store.put(&CheckpointKey::event(&EventId::new("b")), b"1").unwrap();
        store.put(&CheckpointKey::event(&EventId::new("a")), b"2").unwrap();
        store.put(&CheckpointKey::job(&JobId::new("a.x.0")), b"3").unwrap();

        let events = store.list_by_prefix(CheckpointKind::Event).unwrap();
        let keys: Vec<_> = events.iter().map(|(k, _)| k.as_str().to_string()).collect();
        assert_eq!(keys, vec!["event:a", "event:b"]);

        let jobs = store.list_by_prefix(CheckpointKind::Job).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].0.kind(), CheckpointKind::Job);
    }

    #[test]
    fn injected_failures_are_recoverable_and_bounded() {
        let store = InMemoryCheckpointStore::new();
        let key = CheckpointKey::job(&JobId::new("j"));
        store.fail_next_writes(2);

        assert!(store.put(&key, b"x").unwrap_err().is_recoverable());
        assert!(store.delete(&key).is_err());
        store.put(&key, b"x").unwrap();
        assert_eq!(store.write_count(), 1);
    }
}
