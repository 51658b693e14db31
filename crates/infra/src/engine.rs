//! The scheduling engine.
//!
//! Owns the event queue, the job lifecycle manager and the dispatcher, and
//! exposes the steps the coordinator threads drive:
//!
//! - [`Engine::intake_once`]: pull one record, admit it, commit its position
//! - [`Engine::schedule_once`]: settle completions, match pending events,
//!   start ready jobs, release finished events
//! - [`Engine::restore`]: rebuild in-memory state from checkpoints
//!
//! Every state change is checkpointed before it becomes visible, and a
//! record's position is committed only after its event is checkpointed.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use eva_core::{AdapterId, EvaError, EventId, JobId};
use eva_events::{normalize, Event, MessageQueue, MessageQueueError, NormalizeError, Position, ResourceDescriptor, ResourceRef};
use eva_observability::{metrics::names, MetricsSink};

use crate::adapter::{AdapterRegistry, Matcher};
use crate::checkpoint::{CheckpointError, CheckpointStore, Checkpointer};
use crate::config::EngineConfig;
use crate::dispatch::{BackendError, BackendRegistry, Completion, DispatchError, Dispatcher};
use crate::health::{HealthMonitor, HealthReport};
use crate::jobs::{
    FailureKind, Job, JobDisposition, JobFailure, JobLifecycleManager, JobOutput, JobStats, JobStatus, JobTable,
    LifecycleError,
};
use crate::metadata::{MetadataError, MetadataStore};
use crate::queue::{Admission, EventQueue, EventRecord, EventStage, OrderingPolicy};
use crate::retry::retry_transient;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] EvaError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Queue(#[from] MessageQueueError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("unknown adapter '{0}'")]
    UnknownAdapter(AdapterId),

    #[error("engine is draining")]
    Draining,

    #[error("event queue is full")]
    QueueFull,

    #[error("event rejected: {0}")]
    Rejected(String),

    #[error("engine state poisoned")]
    Poisoned,
}

impl EngineError {
    /// Errors after which the engine cannot safely continue.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Checkpoint(_) | Self::Poisoned => true,
            Self::Queue(e) => !e.is_recoverable(),
            Self::Lifecycle(LifecycleError::Checkpoint(_) | LifecycleError::Poisoned(_)) => true,
            _ => false,
        }
    }
}

/// Collaborators the engine is assembled from.
pub struct EngineParts {
    pub adapters: AdapterRegistry,
    pub backends: BackendRegistry,
    pub metadata: Arc<dyn MetadataStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// Result of one [`Engine::intake_once`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Nothing arrived within the pull timeout
    Idle,
    /// Draining or the queue is full; nothing was pulled
    Paused,
    Admitted(EventId),
    Duplicate(EventId),
    TooOld(EventId),
    Heartbeat,
    /// Malformed or unsupported record, committed and dropped
    Discarded,
}

/// Work done by one [`Engine::schedule_once`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub completions: usize,
    pub matched: usize,
    pub jobs_created: usize,
    pub jobs_started: usize,
    pub released: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub events: usize,
    pub jobs: usize,
    pub corrupt: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub name: String,
    pub ordering: &'static str,
    pub events_held: usize,
    pub events_pending: usize,
    pub jobs: JobStats,
    pub in_flight: usize,
    pub draining: bool,
    pub pending_commits: usize,
    pub message_timestamp_threshold: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Stop the loops at their next iteration
    Immediate,
    /// Stop intake, run the queued work to the end, then stop
    Graceful,
}

enum MatchStep {
    Matched { jobs: usize },
    Dropped,
    /// Metadata store unavailable; retry on a later tick
    Deferred,
}

pub struct Engine {
    config: EngineConfig,
    queue: Mutex<EventQueue>,
    /// Serializes admissions so checkpoint I/O happens outside the queue lock
    intake: Mutex<()>,
    registry: Arc<AdapterRegistry>,
    matcher: Matcher,
    lifecycle: JobLifecycleManager,
    dispatcher: Dispatcher,
    metadata: Arc<dyn MetadataStore>,
    checkpointer: Checkpointer,
    health: HealthMonitor,
    metrics: Arc<dyn MetricsSink>,
    draining: AtomicBool,
    queue_connected: AtomicBool,
    shutdown: Mutex<Option<ShutdownMode>>,
    stopped: AtomicBool,
    pending_commits: Mutex<Vec<Position>>,
}

impl Engine {
    pub fn new(config: EngineConfig, parts: EngineParts) -> Result<Self, EngineError> {
        let backend_ids = parts.backends.ids();
        for adapter in parts.adapters.iter() {
            let backend = &adapter.settings().backend;
            if !backend_ids.contains(backend) {
                return Err(EvaError::configuration(format!(
                    "adapter '{}' routes to unknown backend '{backend}'",
                    adapter.id()
                ))
                .into());
            }
        }

        let registry = Arc::new(parts.adapters);
        let checkpointer = Checkpointer::new(parts.checkpoints, config.transient_retry.clone(), parts.metrics.clone());
        let lifecycle = JobLifecycleManager::new(Arc::new(JobTable::new()), checkpointer.clone(), parts.metrics.clone());

        Ok(Self {
            queue: Mutex::new(EventQueue::new(config.queue_config())),
            intake: Mutex::new(()),
            matcher: Matcher::new(registry.clone(), parts.metrics.clone()),
            registry,
            lifecycle,
            dispatcher: Dispatcher::new(parts.backends),
            metadata: parts.metadata,
            checkpointer,
            health: HealthMonitor::new(config.heartbeat_interval, config.heartbeat_timeout, Utc::now()),
            metrics: parts.metrics,
            draining: AtomicBool::new(false),
            queue_connected: AtomicBool::new(true),
            shutdown: Mutex::new(None),
            stopped: AtomicBool::new(false),
            pending_commits: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn adapters(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    fn queue(&self) -> Result<MutexGuard<'_, EventQueue>, EngineError> {
        self.queue.lock().map_err(|_| EngineError::Poisoned)
    }

    // ---- recovery ----

    /// Rebuild the event queue and job table from the checkpoint store.
    ///
    /// Jobs left STARTED go back to INITIALIZED; COMPLETE and FAILED jobs are
    /// settled again. Jobs whose adapter is no longer configured, or whose
    /// event is missing, are deleted and counted as corrupt. Running this
    /// twice leaves the same state as running it once.
    #[instrument(skip(self), fields(engine = %self.config.name), err)]
    pub fn restore(&self) -> Result<RestoreReport, EngineError> {
        let snapshot = self.checkpointer.load()?;
        let now = Utc::now();
        let mut report = RestoreReport {
            corrupt: snapshot.corrupt,
            ..Default::default()
        };

        {
            let mut queue = self.queue()?;
            for record in snapshot.events {
                queue.insert(record);
                report.events += 1;
            }
        }

        let mut unsettled = Vec::new();
        for mut job in snapshot.jobs {
            let Some(adapter) = self.registry.get(&job.adapter_id) else {
                warn!(job_id = %job.id, adapter_id = %job.adapter_id, "dropping job of unknown adapter");
                self.checkpointer.remove_job(&job.id)?;
                report.corrupt += 1;
                continue;
            };
            if !self.queue()?.contains(&job.event_id) {
                warn!(job_id = %job.id, event_id = %job.event_id, "dropping job without source event");
                self.checkpointer.remove_job(&job.id)?;
                report.corrupt += 1;
                continue;
            }
            if self.dispatcher.backends().get(&job.backend).is_none() {
                warn!(job_id = %job.id, backend = %job.backend, "backend no longer configured; rerouting");
                job.backend = adapter.settings().backend.clone();
                self.checkpointer.save_job(&job)?;
            }

            let restored = self.lifecycle.restore(job, now)?;
            if matches!(restored.status, JobStatus::Complete | JobStatus::Failed) {
                unsettled.push(restored);
            }
            report.jobs += 1;
        }

        for job in unsettled {
            self.settle(job, now)?;
        }

        self.metrics.incr_by(names::RESTORED_EVENTS, report.events as u64, &[]);
        self.metrics.incr_by(names::RESTORED_JOBS, report.jobs as u64, &[]);
        self.metrics.incr_by(names::RESTORED_CORRUPT, report.corrupt as u64, &[]);
        info!(
            events = report.events,
            jobs = report.jobs,
            corrupt = report.corrupt,
            "state restored from checkpoints"
        );
        self.update_gauges();
        Ok(report)
    }

    // ---- intake ----

    /// Pull one record from `source` and process it.
    pub fn intake_once(&self, source: &dyn MessageQueue) -> Result<IntakeOutcome, EngineError> {
        self.flush_pending_commits(source);

        if self.intake_closed() || self.queue()?.is_full() {
            return Ok(IntakeOutcome::Paused);
        }

        let pulled = source.pull(self.config.pull_timeout);
        self.queue_connected.store(source.is_connected(), Ordering::SeqCst);
        let record = match pulled {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(IntakeOutcome::Idle),
            Err(e) => {
                self.queue_connected.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let outcome = match normalize(&record) {
            Ok(event) if event.is_heartbeat() => {
                self.health.record_heartbeat(event.timestamp);
                self.metrics.incr(names::EVENT_HEARTBEAT, &[]);
                debug!(event_id = %event.id, "heartbeat");
                IntakeOutcome::Heartbeat
            }
            Ok(event) => self.admit(event)?,
            Err(NormalizeError::UnsupportedVersion { id, version }) => {
                warn!(event_id = %id, %version, "unsupported protocol version; dropping");
                self.metrics.incr(names::EVENT_VERSION_UNSUPPORTED, &[]);
                IntakeOutcome::Discarded
            }
            Err(e) => {
                warn!(position = %record.position, error = %e, "malformed record; dropping");
                self.metrics.incr(names::EVENT_MALFORMED, &[]);
                IntakeOutcome::Discarded
            }
        };

        self.commit(source, &record.position);
        Ok(outcome)
    }

    /// Classify, checkpoint and insert one event.
    fn admit(&self, event: Event) -> Result<IntakeOutcome, EngineError> {
        let _serial = self.intake.lock().map_err(|_| EngineError::Poisoned)?;
        let now = Utc::now();
        let id = event.id.clone();

        let record = {
            let mut queue = self.queue()?;
            match queue.classify(&event, now) {
                Admission::Accepted => queue.prepare(event, now),
                Admission::Duplicate => {
                    debug!(event_id = %id, "duplicate event");
                    self.metrics.incr(names::EVENT_DUPLICATE, &[]);
                    return Ok(IntakeOutcome::Duplicate(id));
                }
                Admission::TooOld => {
                    info!(event_id = %id, timestamp = %event.timestamp, "event too old; dropping");
                    self.metrics.incr(names::EVENT_TOO_OLD, &[]);
                    return Ok(IntakeOutcome::TooOld(id));
                }
            }
        };

        self.checkpointer.save_event(&record)?;
        self.queue()?.insert(record);
        self.metrics.incr(names::EVENT_ADMITTED, &[]);
        info!(event_id = %id, "event admitted");
        Ok(IntakeOutcome::Admitted(id))
    }

    fn commit(&self, source: &dyn MessageQueue, position: &Position) {
        let result = retry_transient(
            &self.config.transient_retry,
            "offset_commit",
            MessageQueueError::is_recoverable,
            || source.commit(position),
        );
        if let Err(e) = result {
            warn!(position = %position, error = %e, "offset commit failed; will retry");
            self.metrics.incr(names::COMMIT_FAILED, &[]);
            if let Ok(mut pending) = self.pending_commits.lock() {
                pending.push(position.clone());
            }
        }
    }

    fn flush_pending_commits(&self, source: &dyn MessageQueue) {
        let pending = match self.pending_commits.lock() {
            Ok(mut pending) if !pending.is_empty() => std::mem::take(&mut *pending),
            _ => return,
        };
        let mut still_pending = Vec::new();
        for position in pending {
            if let Err(e) = source.commit(&position) {
                debug!(position = %position, error = %e, "deferred commit failed again");
                still_pending.push(position);
            }
        }
        if let Ok(mut pending) = self.pending_commits.lock() {
            still_pending.append(&mut pending);
            *pending = still_pending;
        }
    }

    /// Queue a locally generated update event for `reference`, optionally
    /// offered only to `adapters`.
    pub fn inject(&self, reference: ResourceRef, adapters: Vec<AdapterId>) -> Result<EventId, EngineError> {
        if self.intake_closed() {
            return Err(EngineError::Draining);
        }
        if let Some(unknown) = adapters.iter().find(|a| !self.registry.contains(a)) {
            return Err(EngineError::UnknownAdapter(unknown.clone()));
        }
        if self.queue()?.is_full() {
            return Err(EngineError::QueueFull);
        }
        match self.admit(Event::local(reference, adapters))? {
            IntakeOutcome::Admitted(id) => Ok(id),
            other => Err(EngineError::Rejected(format!("{other:?}"))),
        }
    }

    // ---- scheduling ----

    /// One scheduler pass.
    pub fn schedule_once(&self, now: DateTime<Utc>) -> Result<TickReport, EngineError> {
        let mut report = TickReport::default();

        // Completions are already off the channel; one failing must not
        // strand the rest.
        for completion in self.dispatcher.drain_completions() {
            report.completions += 1;
            if let Err(e) = self.handle_completion(completion, now) {
                if e.is_fatal() {
                    return Err(e);
                }
                log_engine_error("completion", &e);
            }
        }

        self.match_pending(&mut report)?;

        if !self.is_draining() {
            self.dispatch_ready(now, &mut report)?;
        }

        self.release_finished(&mut report)?;
        self.update_gauges();
        Ok(report)
    }

    /// Block up to `timeout` for one backend completion and settle it.
    /// Returns whether a completion arrived.
    pub fn await_completion(&self, timeout: Duration) -> Result<bool, EngineError> {
        match self.dispatcher.wait_completion(timeout) {
            Some(completion) => {
                self.handle_completion(completion, Utc::now())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn handle_completion(&self, completion: Completion, now: DateTime<Utc>) -> Result<(), EngineError> {
        let job = match self.lifecycle.finish(&completion) {
            Ok(job) => job,
            Err(e @ (LifecycleError::Checkpoint(_) | LifecycleError::Poisoned(_))) => return Err(e.into()),
            Err(e) => {
                warn!(job_id = %completion.handle.job_id, error = %e, "ignoring completion");
                return Ok(());
            }
        };
        info!(
            job_id = %job.id,
            adapter_id = %job.adapter_id,
            status = %job.status,
            exit_code = ?job.exit_code(),
            "job finished"
        );
        self.settle(job, now)
    }

    /// Drive a COMPLETE or FAILED job to its next state.
    fn settle(&self, job: Job, now: DateTime<Utc>) -> Result<(), EngineError> {
        match job.status {
            JobStatus::Complete => {
                self.emit_derived(&job);
                self.lifecycle.evict(&job.id)?;
            }
            JobStatus::Failed => {
                let Some(adapter) = self.registry.get(&job.adapter_id) else {
                    self.lifecycle.evict(&job.id)?;
                    return Ok(());
                };
                match self.lifecycle.decide(&job.id, adapter.as_ref(), now)? {
                    JobDisposition::Requeued { .. } => {}
                    JobDisposition::GaveUp(reason) => {
                        warn!(job_id = %job.id, ?reason, "job failed permanently");
                        self.lifecycle.evict(&job.id)?;
                    }
                }
            }
            JobStatus::Initialized | JobStatus::Started => {}
        }
        Ok(())
    }

    /// Let the owning adapter derive resources from a completed job and
    /// persist them. Failures are counted; the job stays COMPLETE.
    fn emit_derived(&self, job: &Job) {
        let tags = [("adapter", job.adapter_id.as_str())];
        let Some(adapter) = self.registry.get(&job.adapter_id) else {
            return;
        };
        let event = match self.queue() {
            Ok(queue) => queue.get(&job.event_id).map(|r| r.event.clone()),
            Err(_) => None,
        };
        let Some(event) = event else {
            warn!(job_id = %job.id, event_id = %job.event_id, "source event missing; skipping completion hook");
            return;
        };

        let derived = match panic::catch_unwind(AssertUnwindSafe(|| adapter.on_complete(job, &event))) {
            Ok(Ok(derived)) => derived,
            Ok(Err(e)) => {
                warn!(job_id = %job.id, error = %e, "completion hook failed");
                self.metrics.incr(names::JOB_DERIVED_PERSIST_FAILED, &tags);
                return;
            }
            Err(_) => {
                warn!(job_id = %job.id, "completion hook panicked");
                self.metrics.incr(names::JOB_DERIVED_PERSIST_FAILED, &tags);
                return;
            }
        };

        for resource in derived {
            match self.persist(&resource) {
                Ok(stored) => info!(
                    job_id = %job.id,
                    reference = %stored.reference,
                    object_version = stored.object_version,
                    "derived resource persisted"
                ),
                Err(e) => {
                    warn!(job_id = %job.id, reference = %resource.reference, error = %e, "derived resource not persisted");
                    self.metrics.incr(names::JOB_DERIVED_PERSIST_FAILED, &tags);
                }
            }
        }
    }

    fn persist(&self, resource: &ResourceDescriptor) -> Result<ResourceDescriptor, MetadataError> {
        retry_transient(
            &self.config.transient_retry,
            "metadata_persist",
            MetadataError::is_recoverable,
            || self.metadata.persist(resource),
        )
    }

    fn match_pending(&self, report: &mut TickReport) -> Result<(), EngineError> {
        let pending: Vec<EventRecord> = self.queue()?.pending().into_iter().cloned().collect();
        for record in pending {
            match self.match_record(record)? {
                MatchStep::Matched { jobs } => {
                    report.matched += 1;
                    report.jobs_created += jobs;
                }
                MatchStep::Dropped => report.released += 1,
                MatchStep::Deferred => break,
            }
        }
        Ok(())
    }

    fn match_record(&self, record: EventRecord) -> Result<MatchStep, EngineError> {
        let event = &record.event;

        let resource = match event.resource() {
            Some(_) if event.is_expiry() => None,
            Some(reference) => match self.resolve(event, reference)? {
                Ok(resource) => Some(resource),
                Err(step) => return Ok(step),
            },
            None => {
                self.release_event(&event.id, "no resource")?;
                return Ok(MatchStep::Dropped);
            }
        };

        let outcome = self.matcher.match_event(event, resource.as_ref());
        let mut created = 0;
        for (adapter_id, requests) in &outcome.accepted {
            let Some(adapter) = self.registry.get(adapter_id) else {
                continue;
            };
            for (index, request) in requests.iter().enumerate() {
                let job = Job::new(
                    JobId::derive(&event.id, adapter_id, index),
                    adapter_id.clone(),
                    event.id.clone(),
                    adapter.settings().backend.clone(),
                    request.command.clone(),
                );
                if self.lifecycle.create(job)? {
                    created += 1;
                }
            }
        }

        let mut matched = record.clone();
        matched.stage = EventStage::Matched;
        self.checkpointer.save_event(&matched)?;
        self.queue()?.set_stage(&event.id, EventStage::Matched);

        info!(
            event_id = %event.id,
            accepted = outcome.accepted.len(),
            rejected = outcome.rejected.len(),
            failed = outcome.failed.len(),
            jobs = created,
            "event matched"
        );
        Ok(MatchStep::Matched { jobs: created })
    }

    /// Resolve the event's resource. The outer error is fatal; the inner one
    /// tells the caller what to do with an event that cannot be matched.
    fn resolve(&self, event: &Event, reference: &ResourceRef) -> Result<Result<ResourceDescriptor, MatchStep>, EngineError> {
        let resolved = retry_transient(
            &self.config.transient_retry,
            "metadata_resolve",
            MetadataError::is_recoverable,
            || self.metadata.resolve(reference),
        );
        match resolved {
            Ok(resource) => match event.object_version() {
                Some(expected) if expected != resource.object_version => {
                    info!(
                        event_id = %event.id,
                        reference = %reference,
                        expected,
                        found = resource.object_version,
                        "resource changed since notification; dropping"
                    );
                    self.metrics.incr(names::RESOURCE_VERSION_CONFLICT, &[]);
                    self.release_event(&event.id, "version conflict")?;
                    Ok(Err(MatchStep::Dropped))
                }
                _ => Ok(Ok(resource)),
            },
            Err(e @ MetadataError::Unavailable(_)) => {
                warn!(event_id = %event.id, error = %e, "metadata store unavailable; deferring matching");
                self.metrics.incr(names::RESOURCE_RESOLVE_FAILED, &[("reason", "unavailable")]);
                Ok(Err(MatchStep::Deferred))
            }
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "cannot resolve resource; dropping");
                self.metrics.incr(names::RESOURCE_RESOLVE_FAILED, &[("reason", "not_found")]);
                self.release_event(&event.id, "resource not found")?;
                Ok(Err(MatchStep::Dropped))
            }
        }
    }

    fn dispatch_ready(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<(), EngineError> {
        let order: Vec<EventId> = self.queue()?.ordered().iter().map(|r| r.event.id.clone()).collect();
        let jobs = self.lifecycle.table().snapshot();

        for event_id in &order {
            for job in jobs.iter().filter(|j| &j.event_id == event_id && j.is_ready(now)) {
                let Some(adapter) = self.registry.get(&job.adapter_id) else {
                    continue;
                };
                let running = self.lifecycle.table().started_count_for_adapter(&job.adapter_id);
                if running >= adapter.settings().concurrency || !self.dispatcher.has_capacity(&job.backend) {
                    continue;
                }
                if self.start_job(job, now)? {
                    report.jobs_started += 1;
                }
            }
        }
        Ok(())
    }

    /// STARTED is checkpointed before submission; a submission the backend
    /// never accepted is rolled back.
    fn start_job(&self, job: &Job, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let started = match self.lifecycle.start(&job.id, now) {
            Ok(job) => job,
            Err(e @ (LifecycleError::NotFound(_) | LifecycleError::Transition(_))) => {
                debug!(job_id = %job.id, error = %e, "job no longer startable");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        match self.dispatcher.dispatch(&started) {
            Ok(handle) => {
                info!(job_id = %started.id, backend = %handle.backend, retry_count = started.retry_count, "job started");
                Ok(true)
            }
            Err(DispatchError::Backend(BackendError::Rejected(reason))) => {
                warn!(job_id = %started.id, %reason, "backend rejected job");
                self.metrics.incr(names::JOB_DISPATCH_FAILED, &[("backend", started.backend.as_str())]);
                let failure = JobFailure {
                    kind: FailureKind::Fatal,
                    reason,
                };
                let failed = self.lifecycle.fail(&started.id, failure, JobOutput::default(), now)?;
                self.settle(failed, now)?;
                Ok(false)
            }
            Err(e) => {
                warn!(job_id = %started.id, error = %e, "dispatch failed; job stays queued");
                self.metrics.incr(names::JOB_DISPATCH_FAILED, &[("backend", started.backend.as_str())]);
                self.lifecycle.unstart(&started.id, now)?;
                Ok(false)
            }
        }
    }

    fn release_finished(&self, report: &mut TickReport) -> Result<(), EngineError> {
        let matched = self.queue()?.matched_ids();
        for id in matched {
            if !self.lifecycle.table().has_jobs_for_event(&id) {
                self.release_event(&id, "finished")?;
                report.released += 1;
            }
        }
        Ok(())
    }

    /// Delete the event's checkpoint, then evict it from the queue.
    fn release_event(&self, id: &EventId, reason: &'static str) -> Result<(), EngineError> {
        self.checkpointer.remove_event(id)?;
        self.queue()?.release(id);
        self.metrics.incr(names::EVENT_RELEASED, &[("reason", reason)]);
        debug!(event_id = %id, reason, "event released");
        Ok(())
    }

    fn update_gauges(&self) {
        if let Ok(queue) = self.queue.lock() {
            self.metrics.gauge(names::GAUGE_EVENT_QUEUE, queue.len() as i64, &[]);
        }
        let stats = self.lifecycle.stats();
        self.metrics.gauge(names::GAUGE_JOBS, stats.total() as i64, &[]);
        self.metrics.gauge(names::GAUGE_JOBS_STARTED, stats.started as i64, &[]);
    }

    // ---- control & inspection ----

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Stop (or resume) admitting events and starting jobs. Running jobs
    /// are not affected.
    pub fn set_draining(&self, draining: bool) {
        let was = self.draining.swap(draining, Ordering::SeqCst);
        if was != draining {
            info!(draining, "drain mode changed");
        }
    }

    pub fn set_message_timestamp_threshold(&self, threshold: Option<DateTime<Utc>>) -> Result<(), EngineError> {
        self.queue()?.set_threshold(threshold);
        info!(threshold = ?threshold, "message timestamp threshold updated");
        Ok(())
    }

    /// Graceful keeps matching and dispatching so the held events run to
    /// the end; only intake and injection stop.
    pub fn request_shutdown(&self, mode: ShutdownMode) {
        if let Ok(mut requested) = self.shutdown.lock() {
            // An immediate request is never downgraded to graceful.
            if *requested != Some(ShutdownMode::Immediate) {
                *requested = Some(mode);
            }
        }
        info!(?mode, "shutdown requested");
    }

    pub fn shutdown_requested(&self) -> Option<ShutdownMode> {
        self.shutdown.lock().ok().and_then(|s| *s)
    }

    pub fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Draining or shutting down: no new events are taken in.
    pub fn intake_closed(&self) -> bool {
        self.is_draining() || self.shutdown_requested().is_some()
    }

    /// No job is running and no submission is in flight.
    pub fn is_quiescent(&self) -> bool {
        self.lifecycle.table().count_with_status(JobStatus::Started) == 0 && self.dispatcher.total_in_flight() == 0
    }

    /// Nothing is held and nothing is running.
    pub fn is_finished(&self) -> Result<bool, EngineError> {
        Ok(self.queue()?.is_empty() && self.is_quiescent())
    }

    /// Heartbeats are not expected once intake is closed.
    pub fn health_report(&self, now: DateTime<Utc>) -> HealthReport {
        self.health
            .report(self.queue_connected.load(Ordering::SeqCst), self.intake_closed(), now)
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.lifecycle.table().snapshot()
    }

    pub fn job(&self, id: &JobId) -> Option<Job> {
        self.lifecycle.table().get_cloned(id)
    }

    /// Remove a job that is not running. Its event is released on the next
    /// scheduler pass if no other job refers to it.
    pub fn delete_job(&self, id: &JobId) -> Result<Job, EngineError> {
        Ok(self.lifecycle.abort(id)?)
    }

    /// Held events in policy order.
    pub fn events(&self) -> Result<Vec<EventRecord>, EngineError> {
        Ok(self.queue()?.ordered().into_iter().cloned().collect())
    }

    pub fn ordering(&self) -> OrderingPolicy {
        self.config.ordering
    }

    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let (events_held, events_pending, threshold) = {
            let queue = self.queue()?;
            (queue.len(), queue.pending().len(), queue.threshold())
        };
        Ok(EngineStats {
            name: self.config.name.clone(),
            ordering: self.config.ordering.as_str(),
            events_held,
            events_pending,
            jobs: self.lifecycle.stats(),
            in_flight: self.dispatcher.total_in_flight(),
            draining: self.is_draining(),
            pending_commits: self.pending_commits.lock().map(|p| p.len()).unwrap_or(0),
            message_timestamp_threshold: threshold,
        })
    }
}

impl core::fmt::Debug for Engine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.config.name)
            .field("ordering", &self.config.ordering)
            .field("adapters", &self.registry)
            .field("draining", &self.is_draining())
            .finish()
    }
}

/// Log helper for the coordinator: errors are fatal or just reported.
pub(crate) fn log_engine_error(context: &str, e: &EngineError) {
    if e.is_fatal() {
        error!(context, error = %e, "fatal engine error");
    } else {
        warn!(context, error = %e, "engine error");
    }
}
