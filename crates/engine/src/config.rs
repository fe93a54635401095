//! Engine configuration
//!
//! All knobs have defaults suitable for a single-node deployment and can be
//! overridden through `STEPFLOW_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

/// Routing topic used by the outbox relay
pub const DEFAULT_OUTBOX_TOPIC: &str = "workflow.outbox";

/// Shortest tick interval a background loop accepts
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Runtime configuration shared by the executor, scheduler, relay and workers
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Number of concurrent worker loops draining the dispatch queue
    pub worker_count: usize,

    /// Lease ttl for one instance execution
    pub lease_ttl: Duration,

    /// How long an admission idempotency key is remembered
    pub idempotency_ttl: Duration,

    /// Scheduler tick interval
    pub scheduler_interval: Duration,

    /// Running instances older than this are treated as possibly crashed
    pub heartbeat_timeout: Duration,

    /// Maximum ids enqueued per scheduler query
    pub scheduler_batch_size: usize,

    /// Outbox relay tick interval
    pub outbox_interval: Duration,

    /// Maximum outbox rows fetched per relay tick
    pub outbox_batch_size: usize,

    /// Rows with this many failed attempts are no longer relayed
    pub outbox_max_attempts: i32,

    /// Upper bound for the relay's per-failure backoff
    pub outbox_max_backoff: Duration,

    /// Topic outbox events are published to
    pub outbox_topic: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            lease_ttl: Duration::from_secs(120),
            idempotency_ttl: Duration::from_secs(6 * 60 * 60),
            scheduler_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(5 * 60),
            scheduler_batch_size: 100,
            outbox_interval: Duration::from_secs(3),
            outbox_batch_size: 100,
            outbox_max_attempts: 10,
            outbox_max_backoff: Duration::from_secs(30),
            outbox_topic: DEFAULT_OUTBOX_TOPIC.to_string(),
        }
    }
}

impl EngineConfig {
    /// Build a configuration from `STEPFLOW_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            worker_count: env_or("STEPFLOW_WORKER_COUNT", defaults.worker_count).max(1),
            lease_ttl: env_secs("STEPFLOW_LEASE_TTL_SECS", defaults.lease_ttl),
            idempotency_ttl: env_secs("STEPFLOW_IDEMPOTENCY_TTL_SECS", defaults.idempotency_ttl),
            scheduler_interval: env_interval(
                "STEPFLOW_SCHEDULER_INTERVAL_MS",
                defaults.scheduler_interval,
            ),
            heartbeat_timeout: env_secs(
                "STEPFLOW_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout,
            ),
            scheduler_batch_size: env_or(
                "STEPFLOW_SCHEDULER_BATCH_SIZE",
                defaults.scheduler_batch_size,
            ),
            outbox_interval: env_interval("STEPFLOW_OUTBOX_INTERVAL_MS", defaults.outbox_interval),
            outbox_batch_size: env_or("STEPFLOW_OUTBOX_BATCH_SIZE", defaults.outbox_batch_size),
            outbox_max_attempts: env_or(
                "STEPFLOW_OUTBOX_MAX_ATTEMPTS",
                defaults.outbox_max_attempts,
            ),
            outbox_max_backoff: env_millis(
                "STEPFLOW_OUTBOX_MAX_BACKOFF_MS",
                defaults.outbox_max_backoff,
            ),
            outbox_topic: std::env::var("STEPFLOW_OUTBOX_TOPIC")
                .unwrap_or(defaults.outbox_topic),
        }
    }

    /// Set the number of worker loops
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Set the instance lease ttl
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Set the scheduler interval
    pub fn with_scheduler_interval(mut self, interval: Duration) -> Self {
        self.scheduler_interval = interval.max(MIN_TICK_INTERVAL);
        self
    }

    /// Set the heartbeat timeout for stuck Running instances
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set the outbox relay interval
    pub fn with_outbox_interval(mut self, interval: Duration) -> Self {
        self.outbox_interval = interval.max(MIN_TICK_INTERVAL);
        self
    }

    /// Set the cap on the relay's failure backoff
    pub fn with_outbox_max_backoff(mut self, backoff: Duration) -> Self {
        self.outbox_max_backoff = backoff;
        self
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_interval(key: &str, default: Duration) -> Duration {
    env_millis(key, default).max(MIN_TICK_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.lease_ttl, Duration::from_secs(120));
        assert_eq!(config.scheduler_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(300));
        assert_eq!(config.outbox_interval, Duration::from_secs(3));
        assert_eq!(config.outbox_max_attempts, 10);
        assert_eq!(config.outbox_topic, "workflow.outbox");
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::default()
            .with_worker_count(0)
            .with_lease_ttl(Duration::from_secs(30))
            .with_scheduler_interval(Duration::from_millis(50));

        assert_eq!(config.worker_count, 1);
        assert_eq!(config.lease_ttl, Duration::from_secs(30));
        assert_eq!(config.scheduler_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        std::env::set_var("STEPFLOW_TEST_ONLY_INTERVAL", "0");
        assert_eq!(
            env_interval("STEPFLOW_TEST_ONLY_INTERVAL", Duration::from_secs(5)),
            MIN_TICK_INTERVAL
        );

        let config = EngineConfig::default()
            .with_scheduler_interval(Duration::ZERO)
            .with_outbox_interval(Duration::ZERO);
        assert_eq!(config.scheduler_interval, MIN_TICK_INTERVAL);
        assert_eq!(config.outbox_interval, MIN_TICK_INTERVAL);
    }

    #[test]
    fn test_env_parsing_falls_back_on_garbage() {
        std::env::set_var("STEPFLOW_TEST_ONLY_GARBAGE", "not-a-number");
        assert_eq!(env_or("STEPFLOW_TEST_ONLY_GARBAGE", 7usize), 7);

        std::env::set_var("STEPFLOW_TEST_ONLY_SECS", "9");
        assert_eq!(
            env_secs("STEPFLOW_TEST_ONLY_SECS", Duration::ZERO),
            Duration::from_secs(9)
        );
    }
}
