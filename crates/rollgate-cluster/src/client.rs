//! The control-plane contract consumed by the orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use rollgate_core::{DeploymentTarget, Revision};

/// Errors returned by a control plane.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    /// Control plane unreachable. Retryable.
    #[error("control plane unreachable: {0}")]
    Connectivity(String),

    /// Target or namespace absent. Never retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// A concurrent mutation was detected.
    #[error("conflicting change: {0}")]
    Conflict(String),

    /// The control plane refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The control plane answered with something we could not read.
    #[error("unexpected response: {0}")]
    Malformed(String),
}

impl ClusterError {
    /// Whether a retry could succeed.
    pub fn is_transient(&self, retry_conflicts: bool) -> bool {
        match self {
            ClusterError::Connectivity(_) => true,
            ClusterError::Conflict(_) => retry_conflicts,
            ClusterError::NotFound(_) | ClusterError::Rejected(_) | ClusterError::Malformed(_) => {
                false
            }
        }
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;

/// Replica counts and availability of a deployment, read fresh per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterStatus {
    pub available: u32,
    pub desired: u32,
    pub condition_available: bool,
    /// Image currently set on the target's container.
    pub image: Option<String>,
}

impl ClusterStatus {
    pub fn is_ready(&self) -> bool {
        self.available == self.desired && self.condition_available
    }
}

/// Capabilities the orchestrator needs from a cluster control plane.
///
/// Implementations must not cache state between calls.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fail unless the control plane answers and `namespace` exists.
    async fn check_namespace(&self, namespace: &str) -> ClusterResult<()>;

    /// Declaratively set the target's container image.
    async fn apply_image(&self, target: &DeploymentTarget, image: &str) -> ClusterResult<()>;

    async fn get_status(&self, target: &DeploymentTarget) -> ClusterResult<ClusterStatus>;

    /// Revision history, oldest first.
    async fn get_revision_history(&self, target: &DeploymentTarget) -> ClusterResult<Vec<Revision>>;

    async fn rollback_to(&self, target: &DeploymentTarget, revision: u64) -> ClusterResult<()>;

    /// Serialize every object of `kind` in `namespace`.
    async fn export_resources(&self, namespace: &str, kind: &str)
        -> ClusterResult<serde_json::Value>;
}

#[async_trait]
impl<C: ClusterClient + ?Sized> ClusterClient for Arc<C> {
    async fn check_namespace(&self, namespace: &str) -> ClusterResult<()> {
        (**self).check_namespace(namespace).await
    }

    async fn apply_image(&self, target: &DeploymentTarget, image: &str) -> ClusterResult<()> {
        (**self).apply_image(target, image).await
    }

    async fn get_status(&self, target: &DeploymentTarget) -> ClusterResult<ClusterStatus> {
        (**self).get_status(target).await
    }

    async fn get_revision_history(&self, target: &DeploymentTarget) -> ClusterResult<Vec<Revision>> {
        (**self).get_revision_history(target).await
    }

    async fn rollback_to(&self, target: &DeploymentTarget, revision: u64) -> ClusterResult<()> {
        (**self).rollback_to(target, revision).await
    }

    async fn export_resources(
        &self,
        namespace: &str,
        kind: &str,
    ) -> ClusterResult<serde_json::Value> {
        (**self).export_resources(namespace, kind).await
    }
}
