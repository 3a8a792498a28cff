//! Fleet power transitions.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{PowerAction, PowerControl};
use crate::config::Policy;
use crate::error::OpsError;
use crate::operation::OperationId;
use crate::pool::{FanOutReport, Slot, fan_out};
use crate::retry::{RetryBudget, with_retries};
use crate::target::Target;

/// Time allowed for one control-plane power call.
const POWER_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// What happened to one target.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "message")]
pub enum PowerOutcome {
    /// The control plane accepted the transition.
    Applied,
    /// The control plane rejected it.
    Failed(String),
    /// No answer before the deadline.
    TimedOut,
}

/// Per-target power result.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PowerResult {
    /// Target acted on.
    pub target: Target,
    /// Requested transition.
    pub action: PowerAction,
    /// Outcome.
    pub outcome: PowerOutcome,
}

impl PowerResult {
    /// Returns `true` for [`PowerOutcome::Applied`].
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self.outcome, PowerOutcome::Applied)
    }
}

/// Applies power transitions across fleets.
#[derive(Clone)]
pub struct PowerManager {
    control: Arc<dyn PowerControl>,
    policy: Policy,
}

impl PowerManager {
    /// Creates a manager.
    #[must_use]
    pub fn new(control: Arc<dyn PowerControl>, policy: Policy) -> Self {
        Self { control, policy }
    }

    /// Applies `action` to every target with bounded concurrency.
    ///
    /// # Errors
    ///
    /// Returns [`OpsError::PowerPartialFailure`] with every result when any
    /// target did not transition, and [`OpsError::Cancelled`] on
    /// cancellation.
    pub async fn apply(
        &self,
        operation_id: OperationId,
        targets: Vec<Target>,
        action: PowerAction,
        cancel: &CancellationToken,
    ) -> Result<FanOutReport<PowerResult>, OpsError> {
        let rounds = targets.len().div_ceil(self.policy.max_concurrency.max(1)).max(1);
        let waves = u32::try_from(rounds).unwrap_or(u32::MAX);
        let deadline =
            Instant::now() + POWER_CALL_TIMEOUT.saturating_mul(waves) + self.policy.fanout_grace;
        let budget = RetryBudget::from_policy(&self.policy);

        let pending = targets.clone();
        let slots = fan_out(
            targets,
            self.policy.max_concurrency,
            deadline,
            cancel,
            |target| {
                let control = Arc::clone(&self.control);
                let token = cancel.child_token();
                async move {
                    let call = with_retries(budget, "set_power", &token, || {
                        control.set_power(&target, action)
                    });
                    let outcome = match tokio::time::timeout(POWER_CALL_TIMEOUT, call).await {
                        Ok(Ok(())) => PowerOutcome::Applied,
                        Ok(Err(err)) => PowerOutcome::Failed(err.to_string()),
                        Err(_elapsed) => PowerOutcome::TimedOut,
                    };
                    PowerResult {
                        target,
                        action,
                        outcome,
                    }
                }
            },
        )
        .await
        .map_err(|_| OpsError::Cancelled)?;

        let results = slots
            .into_iter()
            .zip(pending)
            .map(|(slot, target)| match slot {
                Slot::Done(result) => result,
                Slot::Expired => PowerResult {
                    target,
                    action,
                    outcome: PowerOutcome::TimedOut,
                },
                Slot::Crashed(reason) => PowerResult {
                    target,
                    action,
                    outcome: PowerOutcome::Failed(reason),
                },
            })
            .collect::<Vec<_>>();

        for result in &results {
            match &result.outcome {
                PowerOutcome::Applied => info!(target = %result.target, %action, "power transition applied"),
                other => warn!(target = %result.target, %action, outcome = ?other, "power transition did not apply"),
            }
        }

        let report = FanOutReport {
            operation_id,
            results,
        };
        if report.results.iter().all(PowerResult::is_applied) {
            Ok(report)
        } else {
            Err(OpsError::PowerPartialFailure { report })
        }
    }
}
