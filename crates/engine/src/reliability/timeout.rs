//! Step call timeouts
//!
//! Bounds a handler invocation by an optional time limit. The handler gets a
//! child of the caller's cancellation token, which is cancelled when the
//! limit elapses so in-flight I/O can stop early.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why a bounded call did not produce a value
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeoutError {
    /// The time limit elapsed first
    #[error("step timed out after {0:?}")]
    Elapsed(Duration),

    /// The caller's token was cancelled first
    #[error("step cancelled")]
    Cancelled,
}

/// Run `f` under `limit`, linked to `parent`
///
/// `None` means no time limit; the call is still abandoned when `parent` is
/// cancelled.
pub async fn run_with_timeout<F, Fut, T>(
    limit: Option<Duration>,
    parent: &CancellationToken,
    f: F,
) -> Result<T, TimeoutError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = T>,
{
    let child = parent.child_token();
    let call = f(child.clone());

    let result = match limit {
        Some(limit) => tokio::select! {
            out = call => Ok(out),
            _ = tokio::time::sleep(limit) => Err(TimeoutError::Elapsed(limit)),
            _ = parent.cancelled() => Err(TimeoutError::Cancelled),
        },
        None => tokio::select! {
            out = call => Ok(out),
            _ = parent.cancelled() => Err(TimeoutError::Cancelled),
        },
    };

    child.cancel();
    result
}
