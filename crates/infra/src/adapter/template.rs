//! `{{placeholder}}` templates for shell commands and derived resource names.

use std::collections::BTreeMap;

use eva_events::{Event, ResourceDescriptor};

use super::AdapterError;

/// Placeholder namespaces a template may refer to.
const NAMESPACES: [&str; 5] = ["event.", "resource.", "instance.", "adapter.", "job."];

/// Parsed template: literal text interleaved with placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Placeholder(String),
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, AdapterError> {
        let mut parts = Vec::new();
        let mut rest = source;
        while let Some(start) = rest.find("{{") {
            if start > 0 {
                parts.push(Part::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| AdapterError::Template(format!("unterminated placeholder in '{source}'")))?;
            let name = after[..end].trim();
            if !NAMESPACES.iter().any(|ns| name.starts_with(ns) && name.len() > ns.len()) {
                return Err(AdapterError::Template(format!("unknown placeholder '{{{{{name}}}}}'")));
            }
            parts.push(Part::Placeholder(name.to_string()));
            rest = &after[end + 2..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            parts,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Substitute every placeholder; a value missing from `context` is an error.
    pub fn render(&self, context: &TemplateContext) -> Result<String, AdapterError> {
        let mut out = String::with_capacity(self.source.len());
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Placeholder(name) => {
                    let value = context
                        .values
                        .get(name)
                        .ok_or_else(|| AdapterError::Template(format!("no value for '{name}'")))?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

/// Values available to a template.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    values: BTreeMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// `event.*`, `instance.*` and `resource.reference` from the event.
    pub fn with_event(mut self, event: &Event) -> Self {
        self.set("event.id", event.id.as_str());
        self.set("event.timestamp", event.timestamp.to_rfc3339());
        self.set("event.type", event.type_name());
        if let Some(reference) = event.resource() {
            self.set("resource.reference", reference.as_str());
        }
        if let Some(instance) = &event.instance {
            self.set("instance.group", instance.group.as_str());
            self.set("instance.reference_time", instance.reference_time.to_rfc3339());
        }
        self
    }

    /// `resource.reference`, `resource.object_version` and `resource.<attr>`.
    pub fn with_resource(mut self, resource: &ResourceDescriptor) -> Self {
        self.set("resource.reference", resource.reference.as_str());
        self.set("resource.object_version", resource.object_version.to_string());
        for key in resource.attributes.keys() {
            if let Some(value) = resource.attribute_string(key) {
                self.set(format!("resource.{key}"), value);
            }
        }
        self
    }
}
