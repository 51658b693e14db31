//! Engine configuration.

use std::time::Duration;

use eva_core::{EvaError, EvaResult};

use crate::jobs::RetryPolicy;
use crate::queue::{EventQueueConfig, OrderingPolicy};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name used in logs and thread names
    pub name: String,
    pub ordering: OrderingPolicy,
    /// Events older than this are discarded at admission
    pub max_event_age: Option<Duration>,
    /// Released event ids remembered for duplicate detection
    pub dedup_window: usize,
    /// Held events above which intake stops pulling
    pub queue_capacity: usize,
    /// How long one pull waits for a record
    pub pull_timeout: Duration,
    /// Scheduler sleep when there is nothing to do
    pub idle_tick: Duration,
    /// Backoff for checkpoint writes, offset commits and metadata lookups;
    /// also bounds consecutive queue failures before the engine gives up
    pub transient_retry: RetryPolicy,
    /// Expected heartbeat period; `None` disables heartbeat health checks
    pub heartbeat_interval: Option<Duration>,
    /// Grace period on top of the heartbeat interval
    pub heartbeat_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "eva".to_string(),
            ordering: OrderingPolicy::Fifo,
            max_event_age: None,
            dedup_window: 10_000,
            queue_capacity: 10_000,
            pull_timeout: Duration::from_millis(500),
            idle_tick: Duration::from_millis(100),
            transient_retry: RetryPolicy::exponential(5, Duration::from_millis(100), 2.0, Duration::from_secs(5)),
            heartbeat_interval: None,
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_ordering(mut self, ordering: OrderingPolicy) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_max_event_age(mut self, age: Duration) -> Self {
        self.max_event_age = Some(age);
        self
    }

    pub fn with_dedup_window(mut self, window: usize) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    pub fn with_idle_tick(mut self, tick: Duration) -> Self {
        self.idle_tick = tick;
        self
    }

    pub fn with_transient_retry(mut self, policy: RetryPolicy) -> Self {
        self.transient_retry = policy;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn queue_config(&self) -> EventQueueConfig {
        EventQueueConfig {
            policy: self.ordering,
            max_age: self.max_event_age,
            dedup_window: self.dedup_window,
            capacity: self.queue_capacity,
        }
    }

    /// Defaults overridden by `EVA_*` environment variables.
    pub fn from_env() -> EvaResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EvaResult<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let number = |key: &str| -> EvaResult<Option<u64>> {
            get(key)
                .map(|v| {
                    v.parse::<u64>()
                        .map_err(|e| EvaError::configuration(format!("{key}: invalid value '{v}': {e}")))
                })
                .transpose()
        };

        let mut config = Self::default();
        if let Some(name) = get("EVA_NAME") {
            config.name = name;
        }
        if let Some(ordering) = get("EVA_ORDERING") {
            config.ordering = ordering.parse()?;
        }
        if let Some(secs) = number("EVA_MAX_EVENT_AGE_SECS")? {
            config.max_event_age = Some(Duration::from_secs(secs));
        }
        if let Some(window) = number("EVA_DEDUP_WINDOW")? {
            config.dedup_window = window as usize;
        }
        if let Some(capacity) = number("EVA_QUEUE_CAPACITY")? {
            if capacity == 0 {
                return Err(EvaError::configuration("EVA_QUEUE_CAPACITY must be at least 1"));
            }
            config.queue_capacity = capacity as usize;
        }
        if let Some(ms) = number("EVA_PULL_TIMEOUT_MS")? {
            config.pull_timeout = Duration::from_millis(ms);
        }
        if let Some(limit) = number("EVA_TRANSIENT_RETRY_LIMIT")? {
            config.transient_retry.max_retries = limit as u32;
        }
        if let Some(secs) = number("EVA_HEARTBEAT_INTERVAL_SECS")? {
            config.heartbeat_interval = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = number("EVA_HEARTBEAT_TIMEOUT_SECS")? {
            config.heartbeat_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn reads_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("EVA_ORDERING", "adaptive"),
            ("EVA_MAX_EVENT_AGE_SECS", "3600"),
            ("EVA_DEDUP_WINDOW", "50"),
            ("EVA_TRANSIENT_RETRY_LIMIT", "2"),
        ]))
        .unwrap();

        assert_eq!(config.ordering, OrderingPolicy::Adaptive);
        assert_eq!(config.max_event_age, Some(Duration::from_secs(3600)));
        assert_eq!(config.dedup_window, 50);
        assert_eq!(config.transient_retry.max_retries, 2);
        assert_eq!(config.queue_config().dedup_window, 50);
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        for vars in [
            [("EVA_ORDERING", "random")],
            [("EVA_DEDUP_WINDOW", "-1")],
            [("EVA_QUEUE_CAPACITY", "0")],
        ] {
            assert!(matches!(
                EngineConfig::from_lookup(lookup(&vars)),
                Err(EvaError::Configuration(_))
            ));
        }
    }
}
