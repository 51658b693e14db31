//! Ordered, deduplicated holding area for events awaiting matching.
//!
//! The queue itself does no I/O and is not thread-safe; the engine owns it
//! behind a mutex and writes checkpoint records around each mutation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use eva_core::EventId;
use eva_events::Event;

use super::ordering::OrderingPolicy;

/// Matching progress of a held event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStage {
    /// Not yet offered to the adapters
    Pending,
    /// All adapters have been offered the event; waiting for its jobs
    Matched,
}

/// A held event plus queue bookkeeping. This is also the checkpointed form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event: Event,
    pub stage: EventStage,
    /// Monotonic admission counter used as the ordering tie-break
    pub arrival: u64,
    pub admitted_at: DateTime<Utc>,
}

/// Outcome of [`EventQueue::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    Accepted,
    Duplicate,
    TooOld,
}

#[derive(Debug, Clone)]
pub struct EventQueueConfig {
    pub policy: OrderingPolicy,
    /// Events older than this (relative to admission time) are discarded
    pub max_age: Option<Duration>,
    /// How many released ids are remembered for duplicate detection
    pub dedup_window: usize,
    /// Admission back-pressure threshold
    pub capacity: usize,
}

impl Default for EventQueueConfig {
    fn default() -> Self {
        Self {
            policy: OrderingPolicy::Fifo,
            max_age: None,
            dedup_window: 10_000,
            capacity: 10_000,
        }
    }
}

#[derive(Debug)]
pub struct EventQueue {
    config: EventQueueConfig,
    held: HashMap<EventId, EventRecord>,
    recent: VecDeque<EventId>,
    recent_set: HashSet<EventId>,
    next_arrival: u64,
    /// Runtime-adjustable lower bound on event timestamps
    threshold: Option<DateTime<Utc>>,
}

impl EventQueue {
    pub fn new(config: EventQueueConfig) -> Self {
        Self {
            config,
            held: HashMap::new(),
            recent: VecDeque::new(),
            recent_set: HashSet::new(),
            next_arrival: 0,
            threshold: None,
        }
    }

    pub fn policy(&self) -> OrderingPolicy {
        self.config.policy
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.held.len() >= self.config.capacity
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.held.contains_key(id)
    }

    pub fn get(&self, id: &EventId) -> Option<&EventRecord> {
        self.held.get(id)
    }

    pub fn threshold(&self) -> Option<DateTime<Utc>> {
        self.threshold
    }

    /// Skip events with timestamps before `ts` from now on.
    pub fn set_threshold(&mut self, ts: Option<DateTime<Utc>>) {
        self.threshold = ts;
    }

    /// Classify an event without admitting it.
    pub fn classify(&self, event: &Event, now: DateTime<Utc>) -> Admission {
        if self.held.contains_key(&event.id) || self.recent_set.contains(&event.id) {
            return Admission::Duplicate;
        }
        if self.is_too_old(event, now) {
            return Admission::TooOld;
        }
        Admission::Accepted
    }

    fn is_too_old(&self, event: &Event, now: DateTime<Utc>) -> bool {
        if let Some(threshold) = self.threshold {
            if event.timestamp < threshold {
                return true;
            }
        }
        match self.config.max_age.and_then(|d| chrono::Duration::from_std(d).ok()) {
            Some(max_age) => event.timestamp < now - max_age,
            None => false,
        }
    }

    /// Admit an event. Accepted events are inserted as Pending and the
    /// record that must be checkpointed is returned alongside.
    pub fn admit(&mut self, event: Event, now: DateTime<Utc>) -> (Admission, Option<EventRecord>) {
        let admission = self.classify(&event, now);
        if admission != Admission::Accepted {
            return (admission, None);
        }
        let record = self.prepare(event, now);
        self.insert(record.clone());
        (Admission::Accepted, Some(record))
    }

    /// Build the record an accepted event would get, consuming an arrival
    /// number, without inserting it. Used when the checkpoint must be written
    /// before the event becomes visible.
    pub fn prepare(&mut self, event: Event, now: DateTime<Utc>) -> EventRecord {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        EventRecord {
            event,
            stage: EventStage::Pending,
            arrival,
            admitted_at: now,
        }
    }

    /// Insert (or replace) a record. Restoring the same record twice leaves
    /// the queue unchanged.
    pub fn insert(&mut self, record: EventRecord) {
        self.next_arrival = self.next_arrival.max(record.arrival + 1);
        self.held.insert(record.event.id.clone(), record);
    }

    /// Next event to match per policy, without removing it.
    pub fn next(&self) -> Option<&EventRecord> {
        self.ordered()
            .into_iter()
            .find(|r| r.stage == EventStage::Pending)
    }

    /// Pending events in matching order.
    pub fn pending(&self) -> Vec<&EventRecord> {
        self.ordered()
            .into_iter()
            .filter(|r| r.stage == EventStage::Pending)
            .collect()
    }

    /// All held events in policy order.
    pub fn ordered(&self) -> Vec<&EventRecord> {
        let mut records: Vec<&EventRecord> = self.held.values().collect();
        self.config.policy.arrange(&mut records);
        records
    }

    /// Matched events, in no particular order.
    pub fn matched_ids(&self) -> Vec<EventId> {
        self.held
            .values()
            .filter(|r| r.stage == EventStage::Matched)
            .map(|r| r.event.id.clone())
            .collect()
    }

    /// Set the stage of a held event; returns the updated record.
    pub fn set_stage(&mut self, id: &EventId, stage: EventStage) -> Option<EventRecord> {
        let record = self.held.get_mut(id)?;
        record.stage = stage;
        Some(record.clone())
    }

    /// Evict an event, remembering its id for duplicate detection.
    pub fn release(&mut self, id: &EventId) -> Option<EventRecord> {
        let record = self.held.remove(id)?;
        self.remember(id.clone());
        Some(record)
    }

    /// Drop an event that never became durable; its id is not remembered so
    /// a redelivery is processed again.
    pub fn forget(&mut self, id: &EventId) -> Option<EventRecord> {
        self.held.remove(id)
    }

    fn remember(&mut self, id: EventId) {
        if self.config.dedup_window == 0 {
            return;
        }
        if self.recent_set.insert(id.clone()) {
            self.recent.push_back(id);
        }
        while self.recent.len() > self.config.dedup_window {
            if let Some(old) = self.recent.pop_front() {
                self.recent_set.remove(&old);
            }
        }
    }
}
