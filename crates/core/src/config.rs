//! Flat configuration model.
//!
//! Configuration files may use inheritance and includes, but by the time the
//! scheduler sees them they are resolved into `section name -> {key: value}`.
//! Values are kept as strings; typed accessors parse on demand and report
//! failures as [`EvaError::Configuration`].

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EvaError, EvaResult};

/// Resolved configuration: every section with its key/value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlatConfig {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl FlatConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style section insertion (mainly for tests and wiring code).
    pub fn with_section<K, V>(mut self, name: impl Into<String>, entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.insert_section(name, entries);
        self
    }

    pub fn insert_section<K, V>(&mut self, name: impl Into<String>, entries: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        let section = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.sections.insert(name.into(), section);
    }

    /// Parse a JSON object of objects. Scalar values are stringified; arrays
    /// become comma-separated lists.
    pub fn from_json(value: &serde_json::Value) -> EvaResult<Self> {
        let root = value
            .as_object()
            .ok_or_else(|| EvaError::configuration("configuration root must be an object"))?;

        let mut config = Self::new();
        for (name, body) in root {
            let body = body.as_object().ok_or_else(|| {
                EvaError::configuration(format!("section '{name}' must be an object"))
            })?;
            let mut entries = BTreeMap::new();
            for (key, raw) in body {
                entries.insert(key.clone(), scalar_to_string(name, key, raw)?);
            }
            config.sections.insert(name.clone(), entries);
        }
        Ok(config)
    }

    pub fn section(&self, name: &str) -> Option<ConfigSection<'_>> {
        self.sections
            .get_key_value(name)
            .map(|(name, values)| ConfigSection { name, values })
    }

    /// Sections whose name starts with `prefix`, in name order.
    pub fn sections_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = ConfigSection<'a>> + 'a {
        self.sections
            .iter()
            .filter(move |(name, _)| name.starts_with(prefix))
            .map(|(name, values)| ConfigSection { name, values })
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

fn scalar_to_string(section: &str, key: &str, raw: &serde_json::Value) -> EvaResult<String> {
    match raw {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| scalar_to_string(section, key, item))
            .collect::<EvaResult<Vec<_>>>()
            .map(|parts| parts.join(",")),
        serde_json::Value::Object(_) => Err(EvaError::configuration(format!(
            "{section}.{key}: nested objects are not supported"
        ))),
    }
}

/// Borrowed view over one configuration section.
#[derive(Debug, Clone, Copy)]
pub struct ConfigSection<'a> {
    name: &'a str,
    values: &'a BTreeMap<String, String>,
}

impl<'a> ConfigSection<'a> {
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// The section name without its `kind.` prefix (`adapter.foo` -> `foo`).
    pub fn short_name(&self) -> &'a str {
        self.name
            .split_once('.')
            .map(|(_, rest)| rest)
            .unwrap_or(self.name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &'a str> + 'a {
        self.values.keys().map(String::as_str)
    }

    /// Raw value; empty strings count as absent.
    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn require(&self, key: &str) -> EvaResult<&'a str> {
        self.get(key).ok_or_else(|| {
            EvaError::configuration(format!("{}: missing required key '{}'", self.name, key))
        })
    }

    pub fn parse<T>(&self, key: &str) -> EvaResult<Option<T>>
    where
        T: FromStr,
        T::Err: core::fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
                EvaError::configuration(format!("{}.{}: invalid value '{}': {}", self.name, key, raw, e))
            }),
        }
    }

    pub fn parse_or<T>(&self, key: &str, default: T) -> EvaResult<T>
    where
        T: FromStr,
        T::Err: core::fmt::Display,
    {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    /// Comma-separated list; absent keys yield an empty list.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whole seconds as a `Duration`.
    pub fn duration_secs(&self, key: &str) -> EvaResult<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs))
    }
}
