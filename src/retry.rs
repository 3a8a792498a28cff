//! Bounded retry for transient control-plane failures.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backend::BackendError;
use crate::config::Policy;

/// Retry budget derived from [`Policy`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct RetryBudget {
    pub(crate) retries: u32,
    pub(crate) backoff: Duration,
}

impl RetryBudget {
    pub(crate) const fn from_policy(policy: &Policy) -> Self {
        Self {
            retries: policy.transient_retries,
            backoff: policy.retry_backoff,
        }
    }

    /// Budget for calls that must be attempted exactly once.
    pub(crate) const fn single_attempt() -> Self {
        Self {
            retries: 0,
            backoff: Duration::ZERO,
        }
    }
}

/// Calls `call` until it succeeds, fails with a non-transient error, or the
/// budget is spent. Backoff doubles per attempt and is cut short by `cancel`.
pub(crate) async fn with_retries<T, F, Fut>(
    budget: RetryBudget,
    activity: &str,
    cancel: &CancellationToken,
    mut call: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 0;
    let mut delay = budget.backoff;
    loop {
        match call().await {
            Err(err) if err.is_transient() && attempt < budget.retries => {
                attempt += 1;
                warn!(activity, attempt, error = %err, "transient failure, retrying");
                tokio::select! {
                    () = cancel.cancelled() => return Err(BackendError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
                delay = delay.saturating_mul(2);
            }
            outcome => return outcome,
        }
    }
}
