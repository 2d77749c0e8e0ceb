//! Bounded retry with exponential backoff around any `ClusterClient`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use rollgate_core::{DeploymentTarget, Revision};

use crate::client::{ClusterClient, ClusterResult, ClusterStatus};

/// How many times, and how patiently, to retry transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Retry `Conflict` in addition to `Connectivity`.
    pub retry_conflicts: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            retry_conflicts: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base, … capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Wraps a client so transient errors are retried before surfacing.
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: ClusterClient> RetryingClient<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, call: F) -> ClusterResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ClusterResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient(self.policy.retry_conflicts)
                    && attempt < self.policy.max_attempts =>
                {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        op,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient cluster error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(op, attempt, error = %e, "cluster call failed");
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl<C: ClusterClient> ClusterClient for RetryingClient<C> {
    async fn check_namespace(&self, namespace: &str) -> ClusterResult<()> {
        let inner = &self.inner;
        self.with_retry("check_namespace", move || inner.check_namespace(namespace))
            .await
    }

    async fn apply_image(&self, target: &DeploymentTarget, image: &str) -> ClusterResult<()> {
        let inner = &self.inner;
        self.with_retry("apply_image", move || inner.apply_image(target, image))
            .await
    }

    async fn get_status(&self, target: &DeploymentTarget) -> ClusterResult<ClusterStatus> {
        let inner = &self.inner;
        self.with_retry("get_status", move || inner.get_status(target))
            .await
    }

    async fn get_revision_history(&self, target: &DeploymentTarget) -> ClusterResult<Vec<Revision>> {
        let inner = &self.inner;
        self.with_retry("get_revision_history", move || inner.get_revision_history(target))
            .await
    }

    async fn rollback_to(&self, target: &DeploymentTarget, revision: u64) -> ClusterResult<()> {
        let inner = &self.inner;
        self.with_retry("rollback_to", move || inner.rollback_to(target, revision))
            .await
    }

    async fn export_resources(
        &self,
        namespace: &str,
        kind: &str,
    ) -> ClusterResult<serde_json::Value> {
        let inner = &self.inner;
        self.with_retry("export_resources", move || inner.export_resources(namespace, kind))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClusterError;
    use crate::memory::{ClusterOp, InMemoryCluster};
    use std::sync::Arc;

    fn target() -> DeploymentTarget {
        DeploymentTarget::new("backend", "prod", "reg/backend:v2", 2)
    }

    fn cluster() -> Arc<InMemoryCluster> {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_deployment("prod", "backend", "reg/backend:v1", 2);
        cluster
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            retry_conflicts: true,
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(5), Duration::from_secs(10));
        assert_eq!(policy.backoff(64), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_connectivity_until_success() {
        let cluster = cluster();
        cluster.inject(ClusterOp::Apply, ClusterError::Connectivity("eof".into()));
        cluster.inject(ClusterOp::Apply, ClusterError::Connectivity("eof".into()));

        let client = RetryingClient::new(cluster.clone(), RetryPolicy::default());
        client.apply_image(&target(), "reg/backend:v2").await.unwrap();

        assert_eq!(cluster.call_count(ClusterOp::Apply), 3);
        assert_eq!(cluster.current_image("prod", "backend").unwrap(), "reg/backend:v2");
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let cluster = cluster();
        for _ in 0..10 {
            cluster.inject(ClusterOp::Status, ClusterError::Connectivity("refused".into()));
        }
        let client = RetryingClient::new(
            cluster.clone(),
            RetryPolicy {
                max_attempts: 3,
                ..Default::default()
            },
        );
        let err = client.get_status(&target()).await.unwrap_err();
        assert!(matches!(err, ClusterError::Connectivity(_)));
        assert_eq!(cluster.call_count(ClusterOp::Status), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_fails_immediately() {
        let cluster = Arc::new(InMemoryCluster::new());
        let client = RetryingClient::new(cluster.clone(), RetryPolicy::default());
        let err = client.apply_image(&target(), "reg/backend:v2").await.unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
        assert_eq!(cluster.call_count(ClusterOp::Apply), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn conflicts_fail_fast_when_disabled() {
        let cluster = cluster();
        cluster.inject(ClusterOp::Apply, ClusterError::Conflict("modified".into()));
        let client = RetryingClient::new(
            cluster.clone(),
            RetryPolicy {
                retry_conflicts: false,
                ..Default::default()
            },
        );
        let err = client.apply_image(&target(), "reg/backend:v2").await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
        assert_eq!(cluster.call_count(ClusterOp::Apply), 1);
    }
}
