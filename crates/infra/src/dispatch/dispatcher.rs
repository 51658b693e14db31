//! Hands STARTED jobs to their backend and collects completions.
//!
//! Submissions never block on the command; completions arrive on a single
//! channel shared by all backends and are drained by the scheduler loop.

use std::collections::HashMap;
use std::sync::{mpsc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use super::backend::{BackendError, Completion, CompletionSender, Submission, SubmissionHandle};
use super::registry::BackendRegistry;
use crate::jobs::Job;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("backend '{0}' is at its concurrency limit")]
    Saturated(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("dispatcher state poisoned")]
    Poisoned,
}

#[derive(Debug)]
pub struct Dispatcher {
    backends: BackendRegistry,
    in_flight: Mutex<HashMap<String, usize>>,
    sender: CompletionSender,
    receiver: Mutex<mpsc::Receiver<Completion>>,
}

impl Dispatcher {
    pub fn new(backends: BackendRegistry) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            backends,
            in_flight: Mutex::new(HashMap::new()),
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub fn in_flight(&self, backend: &str) -> usize {
        self.in_flight
            .lock()
            .map(|m| m.get(backend).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn total_in_flight(&self) -> usize {
        self.in_flight.lock().map(|m| m.values().sum()).unwrap_or(0)
    }

    /// Whether `backend` can take one more job.
    pub fn has_capacity(&self, backend: &str) -> bool {
        match self.backends.get(backend) {
            Some(slot) => self.in_flight(backend) < slot.concurrency,
            None => false,
        }
    }

    /// Submit a STARTED job to its backend.
    pub fn dispatch(&self, job: &Job) -> Result<SubmissionHandle, DispatchError> {
        let slot = self
            .backends
            .get(&job.backend)
            .ok_or_else(|| DispatchError::UnknownBackend(job.backend.clone()))?;

        let mut in_flight = self.in_flight.lock().map_err(|_| DispatchError::Poisoned)?;
        let running = in_flight.entry(job.backend.clone()).or_insert(0);
        if *running >= slot.concurrency {
            return Err(DispatchError::Saturated(job.backend.clone()));
        }

        let submission = Submission {
            job_id: job.id.clone(),
            command: job.command.clone(),
        };
        let handle = slot.backend.submit(submission, self.sender.clone())?;
        *running += 1;
        debug!(job_id = %job.id, backend = %job.backend, in_flight = *running, "job submitted");
        Ok(handle)
    }

    /// Every completion available right now.
    pub fn drain_completions(&self) -> Vec<Completion> {
        let received: Vec<Completion> = match self.receiver.lock() {
            Ok(rx) => rx.try_iter().collect(),
            Err(_) => Vec::new(),
        };
        for c in &received {
            self.settle(c);
        }
        received
    }

    /// Block up to `timeout` for the next completion.
    pub fn wait_completion(&self, timeout: Duration) -> Option<Completion> {
        let completion = self.receiver.lock().ok()?.recv_timeout(timeout).ok()?;
        self.settle(&completion);
        Some(completion)
    }

    fn settle(&self, completion: &Completion) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            if let Some(n) = in_flight.get_mut(&completion.handle.backend) {
                *n = n.saturating_sub(1);
            }
        }
    }
}
