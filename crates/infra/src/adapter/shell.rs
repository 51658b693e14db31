//! Shell-template adapter.
//!
//! Section keys on top of the common ones:
//!
//! - `command` (required): script template, e.g.
//!   `convert {{resource.reference}} --hour={{instance.reference_time}}`
//! - `accept_expired`: also run for expiry events (default `false`)
//! - `output_reference`: template naming a resource to register after the
//!   job completes; may use `event.*`, `instance.*`, `adapter.id`, `job.id`
//!   and `resource.reference`
//! - `no_retry_exit_codes`: exit codes for which retries are declined

use std::sync::Arc;

use chrono::Utc;

use eva_core::{ConfigSection, EvaError, EvaResult};
use eva_events::{Event, ResourceDescriptor, ResourceRef};

use super::template::{Template, TemplateContext};
use super::{Adapter, AdapterError, AdapterSettings, Evaluation, JobRequest, RetryDecision};
use crate::jobs::{Job, JobCommand};

#[derive(Debug, Clone)]
pub struct ShellAdapter {
    settings: AdapterSettings,
    command: Template,
    accept_expired: bool,
    output_reference: Option<Template>,
    no_retry_exit_codes: Vec<i32>,
}

impl ShellAdapter {
    pub fn new(settings: AdapterSettings, command: &str) -> Result<Self, AdapterError> {
        Ok(Self {
            settings,
            command: Template::parse(command)?,
            accept_expired: false,
            output_reference: None,
            no_retry_exit_codes: Vec::new(),
        })
    }

    pub fn with_accept_expired(mut self, accept: bool) -> Self {
        self.accept_expired = accept;
        self
    }

    pub fn with_output_reference(mut self, template: &str) -> Result<Self, AdapterError> {
        self.output_reference = Some(Template::parse(template)?);
        Ok(self)
    }

    pub fn with_no_retry_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.no_retry_exit_codes = codes;
        self
    }

    pub fn from_config(settings: AdapterSettings, section: &ConfigSection<'_>) -> EvaResult<Arc<dyn Adapter>> {
        let to_config_error = |e: AdapterError| EvaError::configuration(format!("{}: {e}", section.name()));

        let mut adapter = Self::new(settings, section.require("command")?).map_err(to_config_error)?;
        adapter.accept_expired = section.parse_or::<bool>("accept_expired", false)?;
        if let Some(output) = section.get("output_reference") {
            adapter = adapter.with_output_reference(output).map_err(to_config_error)?;
        }
        adapter.no_retry_exit_codes = section
            .list("no_retry_exit_codes")
            .iter()
            .map(|c| {
                c.parse::<i32>().map_err(|e| {
                    EvaError::configuration(format!("{}: invalid exit code '{c}': {e}", section.name()))
                })
            })
            .collect::<EvaResult<Vec<_>>>()?;
        Ok(Arc::new(adapter))
    }

    fn base_context(&self, event: &Event) -> TemplateContext {
        let mut context = TemplateContext::new().with_event(event);
        context.set("adapter.id", self.settings.id.as_str());
        context
    }
}

impl Adapter for ShellAdapter {
    fn settings(&self) -> &AdapterSettings {
        &self.settings
    }

    fn evaluate(&self, event: &Event, resource: Option<&ResourceDescriptor>) -> Result<Evaluation, AdapterError> {
        if event.is_expiry() && !self.accept_expired {
            return Ok(Evaluation::reject("expiry events are not accepted"));
        }
        if let Err(reason) = self.settings.inputs.check(event, resource, Utc::now()) {
            return Ok(Evaluation::reject(reason));
        }

        let mut context = self.base_context(event);
        if let Some(resource) = resource {
            context = context.with_resource(resource);
        }
        let script = self.command.render(&context)?;

        let mut command = JobCommand::script(script)
            .with_env("EVA_EVENT_ID", event.id.as_str())
            .with_env("EVA_ADAPTER_ID", self.settings.id.as_str());
        if let Some(reference) = event.resource() {
            command = command.with_env("EVA_RESOURCE", reference.as_str());
        }
        Ok(Evaluation::accept(JobRequest::new(command)))
    }

    fn on_complete(&self, job: &Job, event: &Event) -> Result<Vec<ResourceDescriptor>, AdapterError> {
        let Some(template) = &self.output_reference else {
            return Ok(Vec::new());
        };
        let mut context = self.base_context(event);
        context.set("job.id", job.id.as_str());
        let reference = template.render(&context)?;

        let descriptor = ResourceDescriptor::new(ResourceRef::new(reference), 0)
            .with_attribute("source_event", event.id.as_str())
            .with_attribute("source_job", job.id.as_str())
            .with_attribute("adapter", self.settings.id.as_str());
        Ok(vec![descriptor])
    }

    fn decide_retry(&self, job: &Job) -> RetryDecision {
        match job.exit_code() {
            Some(code) if self.no_retry_exit_codes.contains(&code) => RetryDecision::Decline,
            _ => RetryDecision::Retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use eva_core::{EventId, FlatConfig, JobId};
    use eva_events::EventPayload;

    use super::*;
    use crate::jobs::JobOutput;

    fn update(id: &str) -> Event {
        Event::new(
            EventId::new(id),
            Utc::now(),
            EventPayload::ResourceUpdated {
                reference: ResourceRef::new("res://in"),
                object_version: Some(1),
            },
        )
    }

    #[test]
    fn renders_command_with_resource_attributes() {
        let adapter = ShellAdapter::new(AdapterSettings::new("conv", "local"), "convert {{resource.reference}} {{resource.format}}").unwrap();
        let resource = ResourceDescriptor::new(ResourceRef::new("res://in"), 1).with_attribute("format", "grib");

        let Evaluation::Accept(requests) = adapter.evaluate(&update("e1"), Some(&resource)).unwrap() else {
            panic!("expected acceptance");
        };
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].command.script, "convert res://in grib");
        assert_eq!(requests[0].command.env.get("EVA_EVENT_ID").map(String::as_str), Some("e1"));
    }

    #[test]
    fn missing_attribute_is_an_evaluation_error() {
        let adapter = ShellAdapter::new(AdapterSettings::new("conv", "local"), "x {{resource.format}}").unwrap();
        let resource = ResourceDescriptor::new(ResourceRef::new("res://in"), 1);
        assert!(adapter.evaluate(&update("e1"), Some(&resource)).is_err());
    }

    #[test]
    fn expiry_events_need_opt_in() {
        let expired = Event::new(
            EventId::new("e2"),
            Utc::now(),
            EventPayload::ResourceExpired {
                reference: ResourceRef::new("res://in"),
                object_version: None,
            },
        );
        let adapter = ShellAdapter::new(AdapterSettings::new("rm", "local"), "rm {{resource.reference}}").unwrap();
        assert!(matches!(adapter.evaluate(&expired, None).unwrap(), Evaluation::Reject(_)));

        let adapter = adapter.with_accept_expired(true);
        assert!(matches!(adapter.evaluate(&expired, None).unwrap(), Evaluation::Accept(_)));
    }

    #[test]
    fn on_complete_emits_output_resource() {
        let adapter = ShellAdapter::new(AdapterSettings::new("conv", "local"), "true")
            .unwrap()
            .with_output_reference("res://out/{{event.id}}")
            .unwrap();
        let event = update("e3");
        let job = Job::new(JobId::new("e3.conv.0"), adapter.id().clone(), event.id.clone(), "local", JobCommand::default());

        let derived = adapter.on_complete(&job, &event).unwrap();
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].reference.as_str(), "res://out/e3");
        assert_eq!(derived[0].object_version, 0);
    }

    #[test]
    fn declines_retry_for_configured_exit_codes() {
        let adapter = ShellAdapter::new(AdapterSettings::new("conv", "local"), "false")
            .unwrap()
            .with_no_retry_exit_codes(vec![2]);
        let mut job = Job::new(JobId::new("j"), adapter.id().clone(), EventId::new("e"), "local", JobCommand::default());

        job.output = Some(JobOutput { exit_code: Some(2), ..Default::default() });
        assert_eq!(adapter.decide_retry(&job), RetryDecision::Decline);
        job.output = Some(JobOutput { exit_code: Some(1), ..Default::default() });
        assert_eq!(adapter.decide_retry(&job), RetryDecision::Retry);
    }

    #[test]
    fn from_config_validates_templates() {
        let config = FlatConfig::new().with_section("adapter.bad", [("executor", "local"), ("command", "{{nope}}")]);
        let section = config.section("adapter.bad").unwrap();
        let settings = AdapterSettings::from_section(&section).unwrap();
        assert!(matches!(ShellAdapter::from_config(settings, &section), Err(EvaError::Configuration(_))));
    }
}
