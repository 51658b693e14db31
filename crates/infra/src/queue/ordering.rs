//! Ordering policies for held events.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use eva_core::EvaError;

use super::event_queue::EventRecord;

/// How held events are ranked for matching. Chosen at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingPolicy {
    /// Oldest timestamp first; ties by arrival.
    #[default]
    Fifo,
    /// Newest timestamp first; ties by arrival.
    Lifo,
    /// FIFO, except members of one instance group are ranked among
    /// themselves by the instance reference time, newest first.
    Adaptive,
}

impl OrderingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderingPolicy::Fifo => "fifo",
            OrderingPolicy::Lifo => "lifo",
            OrderingPolicy::Adaptive => "adaptive",
        }
    }

    /// Sort `records` in matching order.
    pub fn arrange(&self, records: &mut Vec<&EventRecord>) {
        match self {
            OrderingPolicy::Fifo => records.sort_by_key(|r| (r.event.timestamp, r.arrival)),
            OrderingPolicy::Lifo => records.sort_by_key(|r| (Reverse(r.event.timestamp), r.arrival)),
            OrderingPolicy::Adaptive => arrange_adaptive(records),
        }
    }
}

impl core::str::FromStr for OrderingPolicy {
    type Err = EvaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "lifo" => Ok(Self::Lifo),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(EvaError::configuration(format!(
                "unknown ordering policy '{other}' (expected fifo, lifo or adaptive)"
            ))),
        }
    }
}

/// Start from FIFO order, then permute each instance group within the slots
/// its members already occupy. Ungrouped events keep their FIFO slot, and
/// equal reference times fall back to FIFO order.
fn arrange_adaptive(records: &mut Vec<&EventRecord>) {
    records.sort_by_key(|r| (r.event.timestamp, r.arrival));

    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (slot, record) in records.iter().enumerate() {
        if let Some(instance) = &record.event.instance {
            groups.entry(instance.group.as_str()).or_default().push(slot);
        }
    }

    let mut arranged = records.clone();
    for slots in groups.values() {
        let mut members: Vec<&EventRecord> = slots.iter().map(|&s| records[s]).collect();
        members.sort_by_key(|r| {
            let reference_time = r.event.instance.as_ref().map(|i| i.reference_time);
            (Reverse(reference_time), r.event.timestamp, r.arrival)
        });
        for (&slot, member) in slots.iter().zip(members) {
            arranged[slot] = member;
        }
    }
    *records = arranged;
}
