//! Settings shared by every adapter variant.

use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};

use eva_core::{AdapterId, ConfigSection, EvaError, EvaResult};
use eva_events::{Event, ResourceDescriptor};

use crate::jobs::{BackoffStrategy, RetryPolicy};

/// Resource attribute filters; an empty list matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputFilters {
    /// `product` attribute
    pub products: Vec<String>,
    /// `data_format` attribute
    pub data_formats: Vec<String>,
    /// `service_backend` attribute
    pub service_backends: Vec<String>,
    /// Hour (UTC) of the producing instance's reference time
    pub reference_hours: Vec<u32>,
    /// Reject instances whose reference time is older than this
    pub reference_time_threshold: Option<Duration>,
}

impl InputFilters {
    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
            && self.data_formats.is_empty()
            && self.service_backends.is_empty()
            && self.reference_hours.is_empty()
            && self.reference_time_threshold.is_none()
    }

    /// `Err(reason)` when the event/resource fails a filter.
    pub fn check(&self, event: &Event, resource: Option<&ResourceDescriptor>, now: DateTime<Utc>) -> Result<(), String> {
        let attr_filters = [
            ("product", &self.products),
            ("data_format", &self.data_formats),
            ("service_backend", &self.service_backends),
        ];
        for (attr, allowed) in attr_filters {
            if allowed.is_empty() {
                continue;
            }
            let value = resource.and_then(|r| r.attribute_string(attr));
            match value {
                Some(v) if allowed.iter().any(|a| a == &v) => {}
                Some(v) => return Err(format!("{attr} '{v}' not in input filter")),
                None => return Err(format!("resource has no {attr}")),
            }
        }

        if !self.reference_hours.is_empty() || self.reference_time_threshold.is_some() {
            let Some(instance) = &event.instance else {
                return Err("event has no producing instance".to_string());
            };
            if !self.reference_hours.is_empty() && !self.reference_hours.contains(&instance.reference_time.hour()) {
                return Err(format!(
                    "reference hour {} not in input filter",
                    instance.reference_time.hour()
                ));
            }
            if let Some(threshold) = self.reference_time_threshold {
                let limit = now - chrono::Duration::from_std(threshold).unwrap_or_default();
                if instance.reference_time < limit {
                    return Err("reference time older than threshold".to_string());
                }
            }
        }
        Ok(())
    }
}

/// Configuration common to all adapters.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterSettings {
    pub id: AdapterId,
    /// Execution backend jobs are routed to
    pub backend: String,
    /// Maximum STARTED jobs owned by this adapter
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub inputs: InputFilters,
}

impl AdapterSettings {
    pub fn new(id: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            id: AdapterId::new(id),
            backend: backend.into(),
            concurrency: 1,
            retry: RetryPolicy::default(),
            inputs: InputFilters::default(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_inputs(mut self, inputs: InputFilters) -> Self {
        self.inputs = inputs;
        self
    }

    /// Read the common keys of an `adapter.<name>` section:
    ///
    /// `executor` (required), `concurrency`, `retry_limit`,
    /// `retry_interval_secs`, `retry_backoff_factor`, `retry_max_interval_secs`,
    /// `input_product`, `input_data_format`, `input_service_backend`,
    /// `input_reference_hours`, `reference_time_threshold` (seconds).
    pub fn from_section(section: &ConfigSection<'_>) -> EvaResult<Self> {
        let id: AdapterId = section.short_name().parse()?;
        let backend = section.require("executor")?.trim().to_string();

        let concurrency = section.parse_or::<usize>("concurrency", 1)?;
        if concurrency == 0 {
            return Err(EvaError::configuration(format!(
                "{}: concurrency must be at least 1",
                section.name()
            )));
        }

        let max_retries = section.parse_or::<u32>("retry_limit", 5)?;
        let interval = section
            .duration_secs("retry_interval_secs")?
            .unwrap_or(Duration::from_secs(60));
        let factor = section.parse_or::<f64>("retry_backoff_factor", 1.0)?;
        if !(factor.is_finite() && factor >= 1.0) {
            return Err(EvaError::configuration(format!(
                "{}: retry_backoff_factor must be >= 1",
                section.name()
            )));
        }
        let max_delay = section
            .duration_secs("retry_max_interval_secs")?
            .unwrap_or(Duration::from_secs(3600))
            .max(interval);
        let retry = RetryPolicy {
            max_retries,
            base_delay: interval,
            max_delay,
            strategy: if factor > 1.0 {
                BackoffStrategy::Exponential
            } else {
                BackoffStrategy::Fixed
            },
            factor,
        };

        let reference_hours = section
            .list("input_reference_hours")
            .iter()
            .map(|h| {
                h.parse::<u32>().ok().filter(|h| *h < 24).ok_or_else(|| {
                    EvaError::configuration(format!("{}: invalid reference hour '{h}'", section.name()))
                })
            })
            .collect::<EvaResult<Vec<_>>>()?;

        let inputs = InputFilters {
            products: section.list("input_product"),
            data_formats: section.list("input_data_format"),
            service_backends: section.list("input_service_backend"),
            reference_hours,
            reference_time_threshold: section.duration_secs("reference_time_threshold")?,
        };

        Ok(Self {
            id,
            backend,
            concurrency,
            retry,
            inputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use eva_core::{EventId, FlatConfig};
    use eva_events::{EventPayload, ResourceRef};

    use super::*;

    fn event_at_hour(hour: u32) -> Event {
        Event::new(
            EventId::new("e"),
            Utc::now(),
            EventPayload::ResourceUpdated {
                reference: ResourceRef::new("res://a"),
                object_version: Some(1),
            },
        )
        .with_instance("run", Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap())
    }

    #[test]
    fn parses_common_keys() {
        let config = FlatConfig::new().with_section(
            "adapter.convert",
            [
                ("class", "shell"),
                ("executor", "local"),
                ("concurrency", "3"),
                ("retry_limit", "2"),
                ("retry_interval_secs", "10"),
                ("retry_backoff_factor", "2"),
                ("input_product", "arome, ecmwf"),
                ("input_reference_hours", "0,12"),
            ],
        );
        let settings = AdapterSettings::from_section(&config.section("adapter.convert").unwrap()).unwrap();

        assert_eq!(settings.id.as_str(), "convert");
        assert_eq!(settings.backend, "local");
        assert_eq!(settings.concurrency, 3);
        assert_eq!(settings.retry.max_retries, 2);
        assert_eq!(settings.retry.delay_for_attempt(2), Duration::from_secs(20));
        assert_eq!(settings.inputs.products, vec!["arome", "ecmwf"]);
        assert_eq!(settings.inputs.reference_hours, vec![0, 12]);
    }

    #[test]
    fn missing_executor_is_a_configuration_error() {
        let config = FlatConfig::new().with_section("adapter.x", [("class", "null")]);
        let err = AdapterSettings::from_section(&config.section("adapter.x").unwrap()).unwrap_err();
        assert!(matches!(err, EvaError::Configuration(_)));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for (key, value) in [("concurrency", "0"), ("retry_backoff_factor", "0.5"), ("input_reference_hours", "25")] {
            let config = FlatConfig::new().with_section("adapter.x", [("executor", "null"), (key, value)]);
            assert!(
                AdapterSettings::from_section(&config.section("adapter.x").unwrap()).is_err(),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn filters_check_attributes_and_reference_hour() {
        let filters = InputFilters {
            products: vec!["arome".into()],
            reference_hours: vec![6],
            ..Default::default()
        };
        let resource = ResourceDescriptor::new(ResourceRef::new("res://a"), 1).with_attribute("product", "arome");
        let other = ResourceDescriptor::new(ResourceRef::new("res://a"), 1).with_attribute("product", "ecmwf");

        assert!(filters.check(&event_at_hour(6), Some(&resource), Utc::now()).is_ok());
        assert!(filters.check(&event_at_hour(7), Some(&resource), Utc::now()).is_err());
        assert!(filters.check(&event_at_hour(6), Some(&other), Utc::now()).is_err());
        assert!(filters.check(&event_at_hour(6), None, Utc::now()).is_err());
    }
}
