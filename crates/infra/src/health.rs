//! Liveness derived from producer heartbeats and queue connectivity.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// HTTP status reported by the admin surface when unhealthy.
pub const UNHEALTHY_STATUS: u16 = 555;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub queue_connected: bool,
    pub draining: bool,
    pub last_heartbeat: DateTime<Utc>,
    /// `None` when heartbeats are not checked
    pub heartbeat_deadline: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug)]
pub struct HealthMonitor {
    interval: Option<Duration>,
    timeout: Duration,
    last_heartbeat: Mutex<DateTime<Utc>>,
}

impl HealthMonitor {
    /// The first heartbeat deadline counts from `started_at`.
    pub fn new(interval: Option<Duration>, timeout: Duration, started_at: DateTime<Utc>) -> Self {
        Self {
            interval,
            timeout,
            last_heartbeat: Mutex::new(started_at),
        }
    }

    /// Record a heartbeat; older timestamps never move the clock back.
    pub fn record_heartbeat(&self, at: DateTime<Utc>) {
        if let Ok(mut last) = self.last_heartbeat.lock() {
            if at > *last {
                *last = at;
            }
        }
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        match self.last_heartbeat.lock() {
            Ok(last) => *last,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Heartbeats are not checked while draining: producers may be paused on
    /// purpose.
    pub fn report(&self, queue_connected: bool, draining: bool, now: DateTime<Utc>) -> HealthReport {
        let last_heartbeat = self.last_heartbeat();
        let heartbeat_deadline = match (self.interval, draining) {
            (Some(interval), false) => {
                let grace = chrono::Duration::from_std(interval + self.timeout).unwrap_or(chrono::Duration::MAX);
                Some(last_heartbeat.checked_add_signed(grace).unwrap_or(DateTime::<Utc>::MAX_UTC))
            }
            _ => None,
        };

        let reason = if !queue_connected {
            Some("message queue disconnected".to_string())
        } else if heartbeat_deadline.is_some_and(|deadline| now >= deadline) {
            Some(format!("no heartbeat since {}", last_heartbeat.to_rfc3339()))
        } else {
            None
        };

        HealthReport {
            healthy: reason.is_none(),
            queue_connected,
            draining,
            last_heartbeat,
            heartbeat_deadline,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_without_heartbeat_checks() {
        let monitor = HealthMonitor::new(None, Duration::from_secs(60), Utc::now());
        assert!(monitor.report(true, false, Utc::now() + chrono::Duration::days(1)).healthy);
        assert!(!monitor.report(false, false, Utc::now()).healthy);
    }

    #[test]
    fn stale_heartbeat_is_unhealthy_unless_draining() {
        let start = Utc::now();
        let monitor = HealthMonitor::new(Some(Duration::from_secs(10)), Duration::from_secs(5), start);

        assert!(monitor.report(true, false, start + chrono::Duration::seconds(14)).healthy);
        let late = start + chrono::Duration::seconds(16);
        assert!(!monitor.report(true, false, late).healthy);
        assert!(monitor.report(true, true, late).healthy);

        monitor.record_heartbeat(start + chrono::Duration::seconds(15));
        assert!(monitor.report(true, false, late).healthy);
    }

    #[test]
    fn heartbeats_never_move_backwards() {
        let start = Utc::now();
        let monitor = HealthMonitor::new(None, Duration::ZERO, start);
        monitor.record_heartbeat(start - chrono::Duration::seconds(30));
        assert_eq!(monitor.last_heartbeat(), start);
    }
}
