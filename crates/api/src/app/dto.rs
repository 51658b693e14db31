//! Request/response bodies of the admin surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use eva_infra::jobs::{FailureKind, Job, JobStatus};
use eva_infra::ShutdownMode;

#[derive(Debug, Deserialize)]
pub struct DrainRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct ShutdownRequest {
    #[serde(default = "default_graceful")]
    pub graceful: bool,
}

fn default_graceful() -> bool {
    true
}

impl ShutdownRequest {
    pub fn mode(&self) -> ShutdownMode {
        if self.graceful {
            ShutdownMode::Graceful
        } else {
            ShutdownMode::Immediate
        }
    }
}

/// `null` (or a missing field) clears the threshold.
#[derive(Debug, Deserialize)]
pub struct ThresholdRequest {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ProcessRequest {
    pub reference: String,
    /// Offer the event only to these adapters; all adapters when empty
    #[serde(default)]
    pub adapters: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub event_id: String,
}

/// One job as shown by `GET /jobs`.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: String,
    pub adapter_id: String,
    pub event_id: String,
    pub backend: String,
    pub status: JobStatus,
    pub retry_count: u32,
    pub not_before: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureView>,
}

#[derive(Debug, Serialize)]
pub struct FailureView {
    pub kind: FailureKind,
    pub reason: String,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let exit_code = job.exit_code();
        Self {
            id: job.id.into_inner(),
            adapter_id: job.adapter_id.into_inner(),
            event_id: job.event_id.into_inner(),
            backend: job.backend,
            status: job.status,
            retry_count: job.retry_count,
            not_before: job.not_before,
            exit_code,
            failure: job.failure.map(|f| FailureView {
                kind: f.kind,
                reason: f.reason,
            }),
        }
    }
}
