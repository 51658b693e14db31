//! Offers an event to every adapter and collects the verdicts.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

use eva_core::AdapterId;
use eva_events::{Event, ResourceDescriptor};
use eva_observability::{metrics::names, MetricsSink};

use super::{AdapterRegistry, Evaluation, JobRequest};

/// Per-adapter verdicts for one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchOutcome {
    /// Accepting adapters with their job requests, in adapter id order
    pub accepted: Vec<(AdapterId, Vec<JobRequest>)>,
    pub rejected: Vec<(AdapterId, String)>,
    /// Adapters whose evaluation returned an error or panicked
    pub failed: Vec<(AdapterId, String)>,
    /// Adapters not targeted by the event
    pub skipped: Vec<AdapterId>,
}

impl MatchOutcome {
    pub fn job_count(&self) -> usize {
        self.accepted.iter().map(|(_, requests)| requests.len()).sum()
    }
}

pub struct Matcher {
    registry: Arc<AdapterRegistry>,
    metrics: Arc<dyn MetricsSink>,
}

impl Matcher {
    pub fn new(registry: Arc<AdapterRegistry>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { registry, metrics }
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    /// Evaluate `event` against every targeted adapter. One adapter failing
    /// does not affect the others.
    pub fn match_event(&self, event: &Event, resource: Option<&ResourceDescriptor>) -> MatchOutcome {
        let mut outcome = MatchOutcome::default();

        for adapter in self.registry.iter() {
            let id = adapter.id().clone();
            if !event.targets(&id) {
                outcome.skipped.push(id);
                continue;
            }

            let result = panic::catch_unwind(AssertUnwindSafe(|| adapter.evaluate(event, resource)));
            let tags = [("adapter", id.as_str())];
            match result {
                Ok(Ok(Evaluation::Accept(requests))) if !requests.is_empty() => {
                    debug!(event_id = %event.id, adapter_id = %id, jobs = requests.len(), "event accepted");
                    self.metrics.incr(names::ADAPTER_ACCEPTED, &tags);
                    outcome.accepted.push((id, requests));
                }
                Ok(Ok(Evaluation::Accept(_))) => {
                    self.metrics.incr(names::ADAPTER_REJECTED, &tags);
                    outcome.rejected.push((id, "no job requests".to_string()));
                }
                Ok(Ok(Evaluation::Reject(reason))) => {
                    debug!(event_id = %event.id, adapter_id = %id, %reason, "event rejected");
                    self.metrics.incr(names::ADAPTER_REJECTED, &tags);
                    outcome.rejected.push((id, reason));
                }
                Ok(Err(e)) => {
                    warn!(event_id = %event.id, adapter_id = %id, error = %e, "adapter evaluation failed");
                    self.metrics.incr(names::ADAPTER_ERROR, &tags);
                    outcome.failed.push((id, e.to_string()));
                }
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    warn!(event_id = %event.id, adapter_id = %id, %reason, "adapter panicked");
                    self.metrics.incr(names::ADAPTER_ERROR, &tags);
                    outcome.failed.push((id, format!("panic: {reason}")));
                }
            }
        }
        outcome
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use eva_core::EventId;
    use eva_events::{EventPayload, ResourceRef};
    use eva_observability::InMemoryMetrics;

    use super::*;
    use crate::adapter::{Adapter, AdapterError, AdapterSettings, InputFilters, NullAdapter};

    struct Panicking(AdapterSettings);

    impl Adapter for Panicking {
        fn settings(&self) -> &AdapterSettings {
            &self.0
        }

        fn evaluate(&self, _event: &Event, _resource: Option<&ResourceDescriptor>) -> Result<Evaluation, AdapterError> {
            panic!("bad adapter");
        }
    }

    fn event() -> Event {
        Event::new(
            EventId::new("e1"),
            Utc::now(),
            EventPayload::ResourceUpdated {
                reference: ResourceRef::new("res://a"),
                object_version: Some(1),
            },
        )
    }

    fn registry(adapters: Vec<Arc<dyn Adapter>>) -> Arc<AdapterRegistry> {
        let mut registry = AdapterRegistry::new();
        for a in adapters {
            registry.register(a).unwrap();
        }
        Arc::new(registry)
    }

    #[test]
    fn counts_accepts_and_rejects_per_adapter() {
        let picky = AdapterSettings::new("picky", "null").with_inputs(InputFilters {
            products: vec!["other".into()],
            ..Default::default()
        });
        let metrics = InMemoryMetrics::arc();
        let matcher = Matcher::new(
            registry(vec![
                Arc::new(NullAdapter::new(AdapterSettings::new("any", "null"))),
                Arc::new(NullAdapter::new(picky)),
            ]),
            metrics.clone(),
        );
        let resource = ResourceDescriptor::new(ResourceRef::new("res://a"), 1).with_attribute("product", "arome");

        let outcome = matcher.match_event(&event(), Some(&resource));
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].0.as_str(), "any");
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(metrics.counter(names::ADAPTER_ACCEPTED), 1);
        assert_eq!(metrics.counter(names::ADAPTER_REJECTED), 1);
    }

    #[test]
    fn panicking_adapter_is_isolated() {
        let metrics = InMemoryMetrics::arc();
        let matcher = Matcher::new(
            registry(vec![
                Arc::new(Panicking(AdapterSettings::new("boom", "null"))),
                Arc::new(NullAdapter::new(AdapterSettings::new("ok", "null"))),
            ]),
            metrics.clone(),
        );
        let resource = ResourceDescriptor::new(ResourceRef::new("res://a"), 1);

        let outcome = matcher.match_event(&event(), Some(&resource));
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(metrics.counter(names::ADAPTER_ERROR), 1);
    }

    #[test]
    fn targeted_events_skip_other_adapters() {
        let matcher = Matcher::new(
            registry(vec![
                Arc::new(NullAdapter::new(AdapterSettings::new("a", "null"))),
                Arc::new(NullAdapter::new(AdapterSettings::new("b", "null"))),
            ]),
            InMemoryMetrics::arc(),
        );
        let event = Event::local(ResourceRef::new("res://a"), vec![AdapterId::new("b")]);
        let resource = ResourceDescriptor::new(ResourceRef::new("res://a"), 1);

        let outcome = matcher.match_event(&event, Some(&resource));
        assert_eq!(outcome.skipped, vec![AdapterId::new("a")]);
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.job_count(), 1);
    }
}
