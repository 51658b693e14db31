//! Metadata-store client abstraction.
//!
//! The scheduler resolves a notification's resource reference into a full
//! description before matching, and persists resources that adapters derive
//! from completed jobs. Persisting uses optimistic concurrency on
//! `object_version`: the descriptor carries the version the writer expects to
//! replace (0 = create).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;

use eva_events::{ResourceDescriptor, ResourceRef};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    #[error("resource not found: {0}")]
    NotFound(ResourceRef),

    /// Stored version differs from the one the writer expected.
    #[error("version conflict on {reference}: expected {expected}, found {found}")]
    VersionConflict {
        reference: ResourceRef,
        expected: u64,
        found: u64,
    },

    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
}

impl MetadataError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub trait MetadataStore: Send + Sync {
    fn resolve(&self, reference: &ResourceRef) -> Result<ResourceDescriptor, MetadataError>;

    /// Store a resource; returns it with the version assigned by the store.
    fn persist(&self, descriptor: &ResourceDescriptor) -> Result<ResourceDescriptor, MetadataError>;
}

impl<M> MetadataStore for Arc<M>
where
    M: MetadataStore + ?Sized,
{
    fn resolve(&self, reference: &ResourceRef) -> Result<ResourceDescriptor, MetadataError> {
        (**self).resolve(reference)
    }

    fn persist(&self, descriptor: &ResourceDescriptor) -> Result<ResourceDescriptor, MetadataError> {
        (**self).persist(descriptor)
    }
}

/// In-memory metadata store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    resources: RwLock<HashMap<ResourceRef, ResourceDescriptor>>,
    failing_calls: AtomicUsize,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert or replace a resource as-is (no version check).
    pub fn upsert(&self, descriptor: ResourceDescriptor) {
        if let Ok(mut r) = self.resources.write() {
            r.insert(descriptor.reference.clone(), descriptor);
        }
    }

    /// Load resources from a JSON array of descriptors.
    pub fn seed_from_json(&self, value: serde_json::Value) -> Result<usize, serde_json::Error> {
        let descriptors: Vec<ResourceDescriptor> = serde_json::from_value(value)?;
        let n = descriptors.len();
        for d in descriptors {
            self.upsert(d);
        }
        Ok(n)
    }

    pub fn get(&self, reference: &ResourceRef) -> Option<ResourceDescriptor> {
        self.resources.read().ok()?.get(reference).cloned()
    }

    /// Make the next `n` calls fail as unavailable.
    pub fn fail_next_calls(&self, n: usize) {
        self.failing_calls.store(n, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), MetadataError> {
        let injected = self
            .failing_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(MetadataError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn resolve(&self, reference: &ResourceRef) -> Result<ResourceDescriptor, MetadataError> {
        self.check_available()?;
        let resources = self
            .resources
            .read()
            .map_err(|_| MetadataError::Unavailable("lock poisoned".to_string()))?;
        resources
            .get(reference)
            .cloned()
            .ok_or_else(|| MetadataError::NotFound(reference.clone()))
    }

    fn persist(&self, descriptor: &ResourceDescriptor) -> Result<ResourceDescriptor, MetadataError> {
        self.check_available()?;
        let mut resources = self
            .resources
            .write()
            .map_err(|_| MetadataError::Unavailable("lock poisoned".to_string()))?;

        let found = resources
            .get(&descriptor.reference)
            .map(|d| d.object_version)
            .unwrap_or(0);
        if found != descriptor.object_version {
            return Err(MetadataError::VersionConflict {
                reference: descriptor.reference.clone(),
                expected: descriptor.object_version,
                found,
            });
        }

        let mut stored = descriptor.clone();
        stored.object_version = found + 1;
        resources.insert(stored.reference.clone(), stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_creates_then_conflicts_on_stale_version() {
        let store = InMemoryMetadataStore::new();
        let reference = ResourceRef::new("res://out");

        let created = store.persist(&ResourceDescriptor::new(reference.clone(), 0)).unwrap();
        assert_eq!(created.object_version, 1);

        let err = store.persist(&ResourceDescriptor::new(reference.clone(), 0)).unwrap_err();
        assert!(matches!(err, MetadataError::VersionConflict { found: 1, .. }));
        assert!(!err.is_recoverable());

        let updated = store.persist(&created).unwrap();
        assert_eq!(updated.object_version, 2);
    }

    #[test]
    fn resolve_reports_missing_and_unavailable() {
        let store = InMemoryMetadataStore::new();
        let reference = ResourceRef::new("res://x");
        assert!(matches!(store.resolve(&reference), Err(MetadataError::NotFound(_))));

        store.upsert(ResourceDescriptor::new(reference.clone(), 3));
        store.fail_next_calls(1);
        assert!(store.resolve(&reference).unwrap_err().is_recoverable());
        assert_eq!(store.resolve(&reference).unwrap().object_version, 3);
    }

    #[test]
    fn seeds_from_json() {
        let store = InMemoryMetadataStore::new();
        let n = store
            .seed_from_json(serde_json::json!([
                {"reference": "res://a", "object_version": 2, "attributes": {"product": "arome"}}
            ]))
            .unwrap();
        assert_eq!(n, 1);
        let got = store.get(&ResourceRef::new("res://a")).unwrap();
        assert_eq!(got.attribute_string("product").as_deref(), Some("arome"));
    }
}
