//! Rollback controller: reverts a target whose health gate failed.
//!
//! ```text
//! RollingBack --history < 2 entries-----------------> Failed(no-rollback-target)
//! RollingBack --rollback_to(second-most-recent)-----> poll availability
//!     poll ready within rollback_timeout -----------> RolledBack
//!     timeout / mutation error ---------------------> Failed(rollback-failed)
//! ```
//!
//! The previous revision is the entry immediately before the newest one in
//! the live history, not the last known-good revision.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use rollgate_cluster::ClusterClient;
use rollgate_core::{Deadline, FailureReason, RolloutAttempt, RolloutStatus, TransitionError};

use crate::controller::{advance, fail};
use crate::poll::{wait_until_ready, WaitError};
use crate::settings::RolloutSettings;

pub struct RollbackController {
    cluster: Arc<dyn ClusterClient>,
    settings: RolloutSettings,
}

impl RollbackController {
    pub fn new(cluster: Arc<dyn ClusterClient>, settings: RolloutSettings) -> Self {
        Self { cluster, settings }
    }

    /// Drive an attempt in `RollingBack` to `RolledBack` or `Failed`.
    pub async fn run(
        &self,
        attempt: &mut RolloutAttempt,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), TransitionError> {
        if attempt.status != RolloutStatus::RollingBack {
            return Err(TransitionError {
                from: attempt.status,
                to: RolloutStatus::RolledBack,
            });
        }
        let target = attempt.target.clone();

        let history = match self.cluster.get_revision_history(&target).await {
            Ok(history) => history,
            Err(e) => {
                return fail(
                    attempt,
                    FailureReason::RollbackFailed,
                    format!("could not read revision history: {e}"),
                );
            }
        };

        let Some(previous) = history.len().checked_sub(2).map(|i| history[i].clone()) else {
            warn!(
                target = %target.name,
                revisions = history.len(),
                "no revision to roll back to"
            );
            return fail(
                attempt,
                FailureReason::NoRollbackTarget,
                format!("revision history holds {} entries", history.len()),
            );
        };

        info!(
            target = %target.name,
            revision = previous.number,
            image = %previous.image,
            "rolling back"
        );
        if let Err(e) = self.cluster.rollback_to(&target, previous.number).await {
            error!(target = %target.name, error = %e, "rollback mutation failed");
            return fail(
                attempt,
                FailureReason::RollbackFailed,
                format!("rollback to revision {} failed: {e}", previous.number),
            );
        }

        let deadline = Deadline::after(self.settings.rollback_timeout);
        match wait_until_ready(
            self.cluster.as_ref(),
            &target,
            &previous.image,
            deadline,
            self.settings.poll_interval,
            cancel,
        )
        .await
        {
            Ok(_) => {
                advance(attempt, RolloutStatus::RolledBack)?;
                info!(
                    target = %target.name,
                    revision = previous.number,
                    elapsed = ?deadline.elapsed(),
                    "rollback complete"
                );
                Ok(())
            }
            Err(WaitError::Timeout) => {
                error!(target = %target.name, "rollback did not become available, manual intervention required");
                fail(
                    attempt,
                    FailureReason::RollbackFailed,
                    format!(
                        "revision {} not available within {:?}",
                        previous.number, self.settings.rollback_timeout
                    ),
                )
            }
            Err(WaitError::Cancelled) => fail(
                attempt,
                FailureReason::Cancelled,
                "cancelled while rolling back",
            ),
            Err(WaitError::Cluster(e)) => fail(
                attempt,
                FailureReason::RollbackFailed,
                format!("status check failed during rollback: {e}"),
            ),
        }
    }
}
