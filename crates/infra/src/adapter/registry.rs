//! Adapter registry built from `adapter.<name>` config sections.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::info;

use eva_core::{AdapterId, ConfigSection, EvaError, EvaResult, FlatConfig};

use super::{Adapter, AdapterSettings, NullAdapter, ShellAdapter};

/// Builds one adapter variant from its common settings and raw section.
pub type AdapterConstructor = fn(AdapterSettings, &ConfigSection<'_>) -> EvaResult<Arc<dyn Adapter>>;

/// Constructors for the variants shipped with the scheduler, keyed by `class`.
pub fn builtin_constructors() -> BTreeMap<&'static str, AdapterConstructor> {
    let mut table: BTreeMap<&'static str, AdapterConstructor> = BTreeMap::new();
    table.insert("null", NullAdapter::from_config);
    table.insert("shell", ShellAdapter::from_config);
    table
}

/// Named, immutable-after-startup set of adapters.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: BTreeMap<AdapterId, Arc<dyn Adapter>>,
}

impl core::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an adapter; a duplicate id is a configuration error.
    pub fn register(&mut self, adapter: Arc<dyn Adapter>) -> EvaResult<()> {
        let id = adapter.id().clone();
        if self.adapters.contains_key(&id) {
            return Err(EvaError::configuration(format!("duplicate adapter '{id}'")));
        }
        self.adapters.insert(id, adapter);
        Ok(())
    }

    /// Build every `adapter.*` section with the built-in constructors.
    pub fn from_config(config: &FlatConfig, backend_ids: &BTreeSet<String>) -> EvaResult<Self> {
        Self::from_config_with(config, backend_ids, &builtin_constructors())
    }

    /// Build every `adapter.*` section. The section's `class` selects the
    /// constructor; its `executor` must name a configured backend.
    pub fn from_config_with(
        config: &FlatConfig,
        backend_ids: &BTreeSet<String>,
        constructors: &BTreeMap<&'static str, AdapterConstructor>,
    ) -> EvaResult<Self> {
        let mut registry = Self::new();
        for section in config.sections_with_prefix("adapter.") {
            let class = section.require("class")?;
            let constructor = constructors.get(class).ok_or_else(|| {
                EvaError::configuration(format!("{}: unknown adapter class '{class}'", section.name()))
            })?;

            let settings = AdapterSettings::from_section(&section)?;
            if !backend_ids.contains(&settings.backend) {
                return Err(EvaError::configuration(format!(
                    "{}: unknown executor '{}'",
                    section.name(),
                    settings.backend
                )));
            }

            let adapter = constructor(settings, &section)?;
            info!(
                adapter_id = %adapter.id(),
                class,
                backend = %adapter.settings().backend,
                concurrency = adapter.settings().concurrency,
                "adapter configured"
            );
            registry.register(adapter)?;
        }
        Ok(registry)
    }

    pub fn get(&self, id: &AdapterId) -> Option<&Arc<dyn Adapter>> {
        self.adapters.get(id)
    }

    pub fn contains(&self, id: &AdapterId) -> bool {
        self.adapters.contains_key(id)
    }

    /// Adapters in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Adapter>> {
        self.adapters.values()
    }

    pub fn ids(&self) -> Vec<AdapterId> {
        self.adapters.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends() -> BTreeSet<String> {
        ["local".to_string()].into_iter().collect()
    }

    #[test]
    fn builds_adapters_in_id_order() {
        let config = FlatConfig::new()
            .with_section("adapter.zeta", [("class", "null"), ("executor", "local")])
            .with_section("adapter.alpha", [("class", "shell"), ("executor", "local"), ("command", "true")])
            .with_section("executor.local", [("class", "local-shell")]);

        let registry = AdapterRegistry::from_config(&config, &backends()).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ids(), vec![AdapterId::new("alpha"), AdapterId::new("zeta")]);
    }

    #[test]
    fn unknown_class_or_backend_fails() {
        let bad_class = FlatConfig::new().with_section("adapter.x", [("class", "fortran"), ("executor", "local")]);
        assert!(matches!(
            AdapterRegistry::from_config(&bad_class, &backends()),
            Err(EvaError::Configuration(_))
        ));

        let bad_backend = FlatConfig::new().with_section("adapter.x", [("class", "null"), ("executor", "cluster")]);
        assert!(matches!(
            AdapterRegistry::from_config(&bad_backend, &backends()),
            Err(EvaError::Configuration(_))
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = AdapterRegistry::new();
        registry
            .register(Arc::new(NullAdapter::new(AdapterSettings::new("a", "local"))))
            .unwrap();
        assert!(registry
            .register(Arc::new(NullAdapter::new(AdapterSettings::new("a", "local"))))
            .is_err());
    }
}
