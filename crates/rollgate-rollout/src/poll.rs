//! Deadline-bounded availability polling shared by rollout and rollback.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use rollgate_cluster::{ClusterClient, ClusterError, ClusterStatus};
use rollgate_core::{Deadline, DeploymentTarget};

/// Why a wait ended without the target becoming ready.
#[derive(Debug)]
pub(crate) enum WaitError {
    Timeout,
    Cancelled,
    Cluster(ClusterError),
}

/// Resolves once cancellation has been requested. Never resolves if the
/// sending side is gone.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub(crate) fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Sleep for `duration`. Returns `false` if cancelled first.
pub(crate) async fn pause(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Poll `target` until it is fully available on `image`.
///
/// Transient cluster errors are logged and polling continues; anything
/// else ends the wait. Each status call is bounded by the time left.
pub(crate) async fn wait_until_ready(
    cluster: &dyn ClusterClient,
    target: &DeploymentTarget,
    image: &str,
    deadline: Deadline,
    poll_interval: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> Result<ClusterStatus, WaitError> {
    let mut polls = 0u32;
    loop {
        if deadline.is_expired() {
            return Err(WaitError::Timeout);
        }
        polls += 1;

        let status = tokio::select! {
            biased;
            _ = cancelled(cancel) => return Err(WaitError::Cancelled),
            res = tokio::time::timeout(deadline.remaining(), cluster.get_status(target)) => match res {
                Ok(status) => status,
                Err(_) => return Err(WaitError::Timeout),
            },
        };

        match status {
            Ok(status) => {
                debug!(
                    target = %target.name,
                    poll = polls,
                    available = status.available,
                    desired = status.desired,
                    condition_available = status.condition_available,
                    "status polled"
                );
                if status.available * 2 < target.replica_count {
                    warn!(
                        target = %target.name,
                        available = status.available,
                        replicas = target.replica_count,
                        "low availability"
                    );
                }
                let on_image = status.image.as_deref().is_none_or(|live| live == image);
                if status.is_ready() && on_image {
                    return Ok(status);
                }
            }
            Err(e) if e.is_transient(true) => {
                warn!(target = %target.name, error = %e, "status poll failed, will retry");
            }
            Err(e) => return Err(WaitError::Cluster(e)),
        }

        let wait = poll_interval.min(deadline.remaining());
        if !pause(wait, cancel).await {
            return Err(WaitError::Cancelled);
        }
    }
}
