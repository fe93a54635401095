//! Reliability patterns for step execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Exponential backoff with jitter for whole-step retries
//! - [`run_with_timeout`] - Cancellation-linked time limits for handler calls

mod retry;
mod timeout;

pub use retry::{RetryPolicy, DEFAULT_RETRYABLE_STATUS_CODES};
pub use timeout::{run_with_timeout, TimeoutError};
