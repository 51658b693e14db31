use std::sync::Arc;

use chrono::Utc;

use eva_core::{ConfigSection, EvaResult};
use eva_events::{Event, ResourceDescriptor};

use super::{Adapter, AdapterError, AdapterSettings, Evaluation, JobRequest};
use crate::jobs::JobCommand;

/// Script run by every null job.
pub const NULL_SCRIPT: &str = "#!/bin/sh\n/bin/true\n";

/// Accepts every resource update that passes its input filters and runs a
/// no-op job. Useful for smoke-testing a deployment.
#[derive(Debug, Clone)]
pub struct NullAdapter {
    settings: AdapterSettings,
}

impl NullAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        Self { settings }
    }

    pub fn from_config(settings: AdapterSettings, _section: &ConfigSection<'_>) -> EvaResult<Arc<dyn Adapter>> {
        Ok(Arc::new(Self::new(settings)))
    }
}

impl Adapter for NullAdapter {
    fn settings(&self) -> &AdapterSettings {
        &self.settings
    }

    fn evaluate(&self, event: &Event, resource: Option<&ResourceDescriptor>) -> Result<Evaluation, AdapterError> {
        if event.is_expiry() {
            return Ok(Evaluation::reject("expiry events are ignored"));
        }
        if let Err(reason) = self.settings.inputs.check(event, resource, Utc::now()) {
            return Ok(Evaluation::reject(reason));
        }
        Ok(Evaluation::accept(JobRequest::new(JobCommand::script(NULL_SCRIPT))))
    }
}
