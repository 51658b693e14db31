//! Backend registry built from `executor.<name>` config sections.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::info;

use eva_core::{ConfigSection, EvaError, EvaResult, FlatConfig};

use super::backend::ExecutionBackend;
use super::local_shell::LocalShellBackend;
use super::null::NullBackend;

/// Builds one backend from its id and raw section.
pub type BackendConstructor = fn(&str, &ConfigSection<'_>) -> EvaResult<Arc<dyn ExecutionBackend>>;

pub fn builtin_backends() -> BTreeMap<&'static str, BackendConstructor> {
    let mut table: BTreeMap<&'static str, BackendConstructor> = BTreeMap::new();
    table.insert("local-shell", LocalShellBackend::from_config);
    table.insert("null", NullBackend::from_config);
    table
}

/// A backend and its in-flight limit.
#[derive(Clone)]
pub struct BackendSlot {
    pub backend: Arc<dyn ExecutionBackend>,
    pub concurrency: usize,
}

#[derive(Default, Clone)]
pub struct BackendRegistry {
    slots: BTreeMap<String, BackendSlot>,
}

impl core::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let limits: BTreeMap<&str, usize> = self.slots.iter().map(|(k, s)| (k.as_str(), s.concurrency)).collect();
        f.debug_struct("BackendRegistry").field("backends", &limits).finish()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn ExecutionBackend>, concurrency: usize) -> EvaResult<()> {
        let id = backend.id().to_string();
        if concurrency == 0 {
            return Err(EvaError::configuration(format!("backend '{id}': concurrency must be at least 1")));
        }
        if self.slots.contains_key(&id) {
            return Err(EvaError::configuration(format!("duplicate backend '{id}'")));
        }
        self.slots.insert(id, BackendSlot { backend, concurrency });
        Ok(())
    }

    /// Build every `executor.*` section; `class` picks the constructor and
    /// `concurrency` (default 4) bounds in-flight jobs.
    pub fn from_config(config: &FlatConfig) -> EvaResult<Self> {
        let constructors = builtin_backends();
        let mut registry = Self::new();
        for section in config.sections_with_prefix("executor.") {
            let class = section.require("class")?;
            let constructor = constructors.get(class).ok_or_else(|| {
                EvaError::configuration(format!("{}: unknown executor class '{class}'", section.name()))
            })?;
            let concurrency = section.parse_or::<usize>("concurrency", 4)?;
            let backend = constructor(section.short_name(), &section)?;
            info!(backend = section.short_name(), class, concurrency, "execution backend configured");
            registry.register(backend, concurrency)?;
        }
        Ok(registry)
    }

    pub fn get(&self, id: &str) -> Option<&BackendSlot> {
        self.slots.get(id)
    }

    pub fn ids(&self) -> BTreeSet<String> {
        self.slots.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BackendSlot)> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_backends_from_config() {
        let config = FlatConfig::new()
            .with_section("executor.local", [("class", "local-shell"), ("concurrency", "2")])
            .with_section("executor.noop", [("class", "null")]);
        let registry = BackendRegistry::from_config(&config).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("local").unwrap().concurrency, 2);
        assert_eq!(registry.get("noop").unwrap().concurrency, 4);
        assert!(registry.ids().contains("noop"));
    }

    #[test]
    fn rejects_unknown_class_and_zero_concurrency() {
        let unknown = FlatConfig::new().with_section("executor.x", [("class", "slurm")]);
        assert!(BackendRegistry::from_config(&unknown).is_err());

        let zero = FlatConfig::new().with_section("executor.x", [("class", "null"), ("concurrency", "0")]);
        assert!(BackendRegistry::from_config(&zero).is_err());
    }
}
