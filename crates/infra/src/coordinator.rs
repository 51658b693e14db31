//! Background threads driving the engine.
//!
//! - intake: one sequential stream pulling from the message queue
//! - scheduler: settles completions, matches, dispatches and releases
//!
//! Backend completions arrive on their own channel, so a slow backend never
//! stalls intake or matching.

use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use eva_core::EvaError;
use eva_events::MessageQueue;

use crate::engine::{log_engine_error, Engine, EngineError, IntakeOutcome, RestoreReport, ShutdownMode};

/// Loop counters shared with the handle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorStats {
    pub records_pulled: u64,
    pub events_admitted: u64,
    pub records_dropped: u64,
    pub heartbeats: u64,
    pub scheduler_ticks: u64,
    pub jobs_started: u64,
    pub completions: u64,
    pub queue_errors: u64,
    pub uptime_secs: u64,
    /// Set when a loop stopped on an unrecoverable error
    pub fatal_error: Option<String>,
}

/// Handle to control and join the coordinator threads.
#[derive(Debug)]
pub struct CoordinatorHandle {
    engine: Arc<Engine>,
    shutdown: Vec<mpsc::Sender<()>>,
    intake: Option<thread::JoinHandle<()>>,
    scheduler: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<CoordinatorStats>>,
    restored: RestoreReport,
}

impl CoordinatorHandle {
    /// Stop both loops at their next iteration and wait for them. Jobs still
    /// running on backends are picked up again by the next restore.
    pub fn shutdown(mut self) {
        self.engine.request_shutdown(ShutdownMode::Immediate);
        for tx in &self.shutdown {
            let _ = tx.send(());
        }
        self.join_all();
    }

    /// Stop intake and wait up to `timeout` for the held events and their
    /// jobs to finish, then stop. Returns whether everything finished in time.
    pub fn graceful_shutdown(mut self, timeout: Duration) -> bool {
        self.engine.request_shutdown(ShutdownMode::Graceful);
        let deadline = Instant::now() + timeout;
        while !self.engine.is_stopped() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        let drained = self.engine.is_stopped();
        if !drained {
            warn!("graceful shutdown timed out; stopping immediately");
            self.engine.request_shutdown(ShutdownMode::Immediate);
        }
        for tx in &self.shutdown {
            let _ = tx.send(());
        }
        self.join_all();
        drained
    }

    /// Block until both loops have exited on their own.
    pub fn join(mut self) {
        self.join_all();
    }

    pub fn stats(&self) -> CoordinatorStats {
        match self.stats.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.stats().fatal_error
    }

    pub fn restored(&self) -> &RestoreReport {
        &self.restored
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    fn join_all(&mut self) {
        for join in [self.intake.take(), self.scheduler.take()].into_iter().flatten() {
            if join.join().is_err() {
                error!("coordinator thread panicked");
            }
        }
    }
}

#[derive(Debug)]
pub struct Coordinator;

impl Coordinator {
    /// Restore state from checkpoints, then start the scheduler thread and,
    /// when `source` is given, the intake thread.
    pub fn spawn(engine: Arc<Engine>, source: Option<Arc<dyn MessageQueue>>) -> Result<CoordinatorHandle, EngineError> {
        let restored = engine.restore()?;
        let stats = Arc::new(Mutex::new(CoordinatorStats::default()));
        let name = engine.config().name.clone();
        let mut shutdown = Vec::new();

        let (sched_tx, sched_rx) = mpsc::channel::<()>();
        shutdown.push(sched_tx);
        let scheduler = {
            let engine = engine.clone();
            let stats = stats.clone();
            thread::Builder::new()
                .name(format!("{name}-scheduler"))
                .spawn(move || scheduler_loop(engine, sched_rx, stats))
                .map_err(|e| EvaError::fatal(format!("cannot spawn scheduler thread: {e}")))?
        };

        let intake = match source {
            Some(source) => {
                let (intake_tx, intake_rx) = mpsc::channel::<()>();
                shutdown.push(intake_tx);
                let loop_engine = engine.clone();
                let loop_stats = stats.clone();
                let join = thread::Builder::new()
                    .name(format!("{name}-intake"))
                    .spawn(move || intake_loop(loop_engine, source, intake_rx, loop_stats));
                match join {
                    Ok(join) => Some(join),
                    Err(e) => {
                        engine.request_shutdown(ShutdownMode::Immediate);
                        return Err(EvaError::fatal(format!("cannot spawn intake thread: {e}")).into());
                    }
                }
            }
            None => None,
        };

        info!(engine = %name, intake = intake.is_some(), "coordinator started");
        Ok(CoordinatorHandle {
            engine,
            shutdown,
            intake,
            scheduler: Some(scheduler),
            stats,
            restored,
        })
    }
}

fn with_stats(stats: &Mutex<CoordinatorStats>, update: impl FnOnce(&mut CoordinatorStats)) {
    if let Ok(mut s) = stats.lock() {
        update(&mut s);
    }
}

fn record_fatal(engine: &Engine, stats: &Mutex<CoordinatorStats>, e: &EngineError) {
    with_stats(stats, |s| s.fatal_error = Some(e.to_string()));
    engine.request_shutdown(ShutdownMode::Immediate);
}

/// Wait on the shutdown channel; `true` means stop.
fn wait_or_stop(shutdown_rx: &mpsc::Receiver<()>, delay: Duration) -> bool {
    !matches!(shutdown_rx.recv_timeout(delay), Err(RecvTimeoutError::Timeout))
}

fn intake_loop(
    engine: Arc<Engine>,
    source: Arc<dyn MessageQueue>,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<CoordinatorStats>>,
) {
    let idle = engine.config().idle_tick;
    let policy = engine.config().transient_retry.clone();
    let mut consecutive_failures: u32 = 0;
    info!(engine = %engine.config().name, "intake loop started");

    loop {
        if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) || engine.shutdown_requested().is_some() {
            break;
        }

        match engine.intake_once(source.as_ref()) {
            Ok(outcome) => {
                consecutive_failures = 0;
                with_stats(&stats, |s| match &outcome {
                    IntakeOutcome::Idle | IntakeOutcome::Paused => {}
                    IntakeOutcome::Admitted(_) => {
                        s.records_pulled += 1;
                        s.events_admitted += 1;
                    }
                    IntakeOutcome::Heartbeat => {
                        s.records_pulled += 1;
                        s.heartbeats += 1;
                    }
                    IntakeOutcome::Duplicate(_) | IntakeOutcome::TooOld(_) | IntakeOutcome::Discarded => {
                        s.records_pulled += 1;
                        s.records_dropped += 1;
                    }
                });
                if outcome == IntakeOutcome::Paused && wait_or_stop(&shutdown_rx, idle) {
                    break;
                }
            }
            Err(e) if e.is_fatal() => {
                log_engine_error("intake", &e);
                record_fatal(&engine, &stats, &e);
                break;
            }
            Err(EngineError::Queue(e)) => {
                consecutive_failures += 1;
                with_stats(&stats, |s| s.queue_errors += 1);
                if !policy.should_retry(consecutive_failures - 1) {
                    let e = EngineError::Queue(e);
                    error!(failures = consecutive_failures, error = %e, "message queue unavailable; giving up");
                    record_fatal(&engine, &stats, &e);
                    break;
                }
                let delay = policy.delay_for_attempt(consecutive_failures);
                warn!(
                    failures = consecutive_failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "message queue error; reconnecting"
                );
                if wait_or_stop(&shutdown_rx, delay) {
                    break;
                }
                if let Err(e) = source.reconnect() {
                    warn!(error = %e, "reconnect failed");
                }
            }
            Err(e) => {
                log_engine_error("intake", &e);
                if wait_or_stop(&shutdown_rx, idle) {
                    break;
                }
            }
        }
    }
    info!(engine = %engine.config().name, "intake loop stopped");
}

fn scheduler_loop(engine: Arc<Engine>, shutdown_rx: mpsc::Receiver<()>, stats: Arc<Mutex<CoordinatorStats>>) {
    let idle = engine.config().idle_tick;
    let started = Instant::now();
    info!(engine = %engine.config().name, "scheduler loop started");

    loop {
        if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
            break;
        }
        match engine.shutdown_requested() {
            Some(ShutdownMode::Immediate) => break,
            Some(ShutdownMode::Graceful) if matches!(engine.is_finished(), Ok(true)) => {
                info!("event queue empty and no running jobs; stopping");
                break;
            }
            _ => {}
        }

        match engine.schedule_once(Utc::now()) {
            Ok(report) => {
                with_stats(&stats, |s| {
                    s.scheduler_ticks += 1;
                    s.jobs_started += report.jobs_started as u64;
                    s.completions += report.completions as u64;
                    s.uptime_secs = started.elapsed().as_secs();
                });
                if report.is_idle() {
                    match engine.await_completion(idle) {
                        Ok(true) => with_stats(&stats, |s| s.completions += 1),
                        Ok(false) => {}
                        Err(e) if e.is_fatal() => {
                            log_engine_error("scheduler", &e);
                            record_fatal(&engine, &stats, &e);
                            break;
                        }
                        Err(e) => log_engine_error("scheduler", &e),
                    }
                }
            }
            Err(e) if e.is_fatal() => {
                log_engine_error("scheduler", &e);
                record_fatal(&engine, &stats, &e);
                break;
            }
            Err(e) => {
                log_engine_error("scheduler", &e);
                if wait_or_stop(&shutdown_rx, idle) {
                    break;
                }
            }
        }
    }

    engine.mark_stopped();
    info!(engine = %engine.config().name, "scheduler loop stopped");
}
