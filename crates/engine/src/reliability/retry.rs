//! Retry policy implementation

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// HTTP status codes retried when a step does not configure its own set
pub const DEFAULT_RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Per-step retry configuration
///
/// Mirrors the `retryPolicy` object of the workflow definition. Every field
/// is optional on the wire and falls back to the defaults below.
///
/// # Example
///
/// ```
/// use stepflow_engine::RetryPolicy;
///
/// let policy = RetryPolicy::default()
///     .with_max_attempts(5)
///     .with_initial_delay_ms(1000)
///     .with_jitter(false);
///
/// // First retry after 1 second, second after 2 seconds, etc.
/// assert_eq!(policy.backoff_millis(1), 1000.0);
/// assert_eq!(policy.backoff_millis(2), 2000.0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Backoff multiplier; non-positive values fall back to 2
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Scale each delay by a random factor in [0.9, 1.1)
    #[serde(default = "default_jitter")]
    pub jitter: bool,

    /// Status codes the HTTP step retries inside one attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable_status_codes: Option<Vec<u16>>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
            retryable_status_codes: None,
        }
    }
}

impl RetryPolicy {
    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the delay before the first retry
    pub fn with_initial_delay_ms(mut self, delay_ms: u64) -> Self {
        self.initial_delay_ms = delay_ms;
        self
    }

    /// Set the backoff multiplier
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Override the retryable HTTP status codes
    pub fn with_retryable_status_codes(mut self, codes: Vec<u16>) -> Self {
        self.retryable_status_codes = Some(codes);
        self
    }

    /// Backoff multiplier actually applied
    pub fn effective_backoff_factor(&self) -> f64 {
        if self.backoff_factor <= 0.0 {
            2.0
        } else {
            self.backoff_factor
        }
    }

    /// Un-jittered delay in milliseconds after the given attempt (1-based)
    pub fn backoff_millis(&self, attempt: u32) -> f64 {
        let exponent = attempt.saturating_sub(1) as i32;
        self.initial_delay_ms as f64 * self.effective_backoff_factor().powi(exponent)
    }

    /// Delay after the given attempt, jitter applied when enabled
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut millis = self.backoff_millis(attempt);
        if self.jitter {
            millis *= rand::thread_rng().gen_range(0.9..1.1);
        }
        Duration::try_from_secs_f64((millis / 1000.0).max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Point in time at which a step that failed on `attempt` runs again
    pub fn next_retry_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay_for_attempt(attempt);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Check if there are remaining attempts
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }

    /// Status codes the HTTP step treats as transient
    pub fn retryable_status_codes(&self) -> &[u16] {
        self.retryable_status_codes
            .as_deref()
            .unwrap_or(&DEFAULT_RETRYABLE_STATUS_CODES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay_ms, 500);
        assert_eq!(policy.backoff_factor, 2.0);
        assert!(policy.jitter);
        assert_eq!(
            policy.retryable_status_codes(),
            &[408, 429, 500, 502, 503, 504]
        );
    }

    #[test]
    fn test_next_retry_at_without_jitter() {
        let policy = RetryPolicy::default().with_jitter(false);
        let now = Utc::now();

        for attempt in 1..=6u32 {
            let expected = now
                + chrono::Duration::milliseconds(500 * 2i64.pow(attempt - 1));
            assert_eq!(policy.next_retry_at(attempt, now), expected);
        }
    }

    #[test]
    fn test_attempt_zero_uses_initial_delay() {
        let policy = RetryPolicy::default().with_jitter(false);
        assert_eq!(policy.backoff_millis(0), 500.0);
    }

    #[test]
    fn test_non_positive_factor_falls_back_to_two() {
        let policy = RetryPolicy::default()
            .with_jitter(false)
            .with_backoff_factor(0.0);
        assert_eq!(policy.backoff_millis(3), 2000.0);

        let policy = policy.with_backoff_factor(-1.5);
        assert_eq!(policy.backoff_millis(2), 1000.0);
    }

    #[test]
    fn test_overflowing_backoff_saturates() {
        let policy = RetryPolicy::default()
            .with_jitter(false)
            .with_initial_delay_ms(u64::MAX)
            .with_backoff_factor(1e300);
        let now = Utc::now();

        assert_eq!(policy.delay_for_attempt(5), Duration::MAX);
        assert_eq!(policy.next_retry_at(5, now), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::default().with_initial_delay_ms(1000);
        let now = Utc::now();

        for _ in 0..200 {
            let delay = (policy.next_retry_at(1, now) - now).num_milliseconds();
            assert!((900..1100).contains(&delay), "delay {delay} out of band");
        }
    }

    #[test]
    fn test_has_attempts_remaining() {
        let policy = RetryPolicy::default();
        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
        assert!(!RetryPolicy::no_retry().has_attempts_remaining(1));
    }

    #[test]
    fn test_wire_format_defaults() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"maxAttempts": 5, "retryableStatusCodes": [503]}"#).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay_ms, 500);
        assert!(policy.jitter);
        assert_eq!(policy.retryable_status_codes(), &[503]);
    }
}
