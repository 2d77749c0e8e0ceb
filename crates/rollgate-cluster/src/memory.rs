//! In-memory control plane.
//!
//! Behaves like a deployment controller: setting a new image records a
//! new revision and the deployment becomes available again after a
//! configurable number of status polls. Rolling back re-activates an
//! older revision under a fresh revision number. Errors can be injected
//! per operation and every call is counted, which makes it the backing
//! store for rollout, rollback, and sequencer tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use rollgate_core::{DeploymentTarget, Revision};

use crate::client::{ClusterClient, ClusterError, ClusterResult, ClusterStatus};

/// Operations that can be counted or have errors injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterOp {
    CheckNamespace,
    Apply,
    Status,
    History,
    Rollback,
    Export,
}

#[derive(Debug)]
struct SimDeployment {
    image: String,
    desired: u32,
    available: u32,
    condition_available: bool,
    revisions: Vec<Revision>,
    next_revision: u64,
    ready_after: u32,
    /// Polls left before the current image is fully available.
    settling: Option<u32>,
}

impl SimDeployment {
    fn start_rollout(&mut self, image: &str) {
        self.image = image.to_string();
        self.available = 0;
        self.condition_available = false;
        self.settling = Some(self.ready_after);
        if self.ready_after == 0 {
            self.finish_rollout();
        }
    }

    fn finish_rollout(&mut self) {
        self.available = self.desired;
        self.condition_available = true;
        self.settling = None;
    }

    fn push_revision(&mut self, image: &str) {
        self.revisions.push(Revision {
            number: self.next_revision,
            image: image.to_string(),
        });
        self.next_revision += 1;
    }
}

#[derive(Debug, Default)]
struct SimState {
    namespaces: HashSet<String>,
    deployments: HashMap<(String, String), SimDeployment>,
    never_ready: HashSet<String>,
    injected: HashMap<ClusterOp, VecDeque<ClusterError>>,
    calls: HashMap<ClusterOp, u32>,
    log: Vec<String>,
    unreachable: bool,
}

impl SimState {
    /// Count the call and surface any scripted failure.
    fn enter(&mut self, op: ClusterOp, detail: String) -> ClusterResult<()> {
        *self.calls.entry(op).or_default() += 1;
        self.log.push(detail);
        if self.unreachable {
            return Err(ClusterError::Connectivity("control plane unreachable".to_string()));
        }
        if let Some(err) = self.injected.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(())
    }

    fn deployment(&mut self, target: &DeploymentTarget) -> ClusterResult<&mut SimDeployment> {
        self.deployments
            .get_mut(&(target.namespace.clone(), target.deployment.clone()))
            .ok_or_else(|| {
                ClusterError::NotFound(format!(
                    "deployment {}/{}",
                    target.namespace, target.deployment
                ))
            })
    }
}

/// A scripted, in-process control plane.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: Mutex<SimState>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_namespace(&self, namespace: &str) {
        self.lock().namespaces.insert(namespace.to_string());
    }

    /// Register a ready deployment whose history holds one revision.
    pub fn add_deployment(&self, namespace: &str, name: &str, image: &str, replicas: u32) {
        let mut state = self.lock();
        state.namespaces.insert(namespace.to_string());
        let mut deployment = SimDeployment {
            image: image.to_string(),
            desired: replicas,
            available: replicas,
            condition_available: true,
            revisions: Vec::new(),
            next_revision: 1,
            ready_after: 1,
            settling: None,
        };
        deployment.push_revision(image);
        state
            .deployments
            .insert((namespace.to_string(), name.to_string()), deployment);
    }

    /// Number of status polls a rollout needs before it reports available.
    pub fn set_ready_after(&self, namespace: &str, name: &str, polls: u32) {
        if let Some(d) = self
            .lock()
            .deployments
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            d.ready_after = polls;
        }
    }

    /// Deployments running `image` never become available.
    pub fn mark_never_ready(&self, image: &str) {
        self.lock().never_ready.insert(image.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Fail the next call of `op` with `err`. Injections queue up.
    pub fn inject(&self, op: ClusterOp, err: ClusterError) {
        self.lock().injected.entry(op).or_default().push_back(err);
    }

    /// Drop all but the newest `keep` revisions.
    pub fn prune_history(&self, namespace: &str, name: &str, keep: usize) {
        if let Some(d) = self
            .lock()
            .deployments
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            let excess = d.revisions.len().saturating_sub(keep);
            d.revisions.drain(..excess);
        }
    }

    pub fn call_count(&self, op: ClusterOp) -> u32 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn current_image(&self, namespace: &str, name: &str) -> Option<String> {
        self.lock()
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .map(|d| d.image.clone())
    }

    pub fn revisions(&self, namespace: &str, name: &str) -> Vec<Revision> {
        self.lock()
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .map(|d| d.revisions.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn check_namespace(&self, namespace: &str) -> ClusterResult<()> {
        let mut state = self.lock();
        state.enter(ClusterOp::CheckNamespace, format!("check-namespace {namespace}"))?;
        if state.namespaces.contains(namespace) {
            Ok(())
        } else {
            Err(ClusterError::NotFound(format!("namespace {namespace}")))
        }
    }

    async fn apply_image(&self, target: &DeploymentTarget, image: &str) -> ClusterResult<()> {
        let mut state = self.lock();
        state.enter(ClusterOp::Apply, format!("apply {}={image}", target.deployment))?;
        let deployment = state.deployment(target)?;
        if deployment.image == image {
            return Ok(());
        }
        deployment.push_revision(image);
        deployment.start_rollout(image);
        debug!(deployment = %target.deployment, %image, "simulated image update");
        Ok(())
    }

    async fn get_status(&self, target: &DeploymentTarget) -> ClusterResult<ClusterStatus> {
        let mut state = self.lock();
        state.enter(ClusterOp::Status, format!("status {}", target.deployment))?;
        let image = state.deployment(target)?.image.clone();
        let stuck = state.never_ready.contains(&image);
        let deployment = state.deployment(target)?;
        if let Some(left) = deployment.settling {
            if !stuck {
                let left = left.saturating_sub(1);
                if left == 0 {
                    deployment.finish_rollout();
                } else {
                    deployment.settling = Some(left);
                }
            }
        }
        Ok(ClusterStatus {
            available: deployment.available,
            desired: deployment.desired,
            condition_available: deployment.condition_available,
            image: Some(deployment.image.clone()),
        })
    }

    async fn get_revision_history(&self, target: &DeploymentTarget) -> ClusterResult<Vec<Revision>> {
        let mut state = self.lock();
        state.enter(ClusterOp::History, format!("history {}", target.deployment))?;
        Ok(state.deployment(target)?.revisions.clone())
    }

    async fn rollback_to(&self, target: &DeploymentTarget, revision: u64) -> ClusterResult<()> {
        let mut state = self.lock();
        state.enter(
            ClusterOp::Rollback,
            format!("rollback {} to {revision}", target.deployment),
        )?;
        let deployment = state.deployment(target)?;
        let index = deployment
            .revisions
            .iter()
            .position(|r| r.number == revision)
            .ok_or_else(|| ClusterError::NotFound(format!("revision {revision}")))?;
        let restored = deployment.revisions.remove(index);
        deployment.push_revision(&restored.image);
        deployment.start_rollout(&restored.image);
        debug!(deployment = %target.deployment, revision, "simulated rollback");
        Ok(())
    }

    async fn export_resources(
        &self,
        namespace: &str,
        kind: &str,
    ) -> ClusterResult<serde_json::Value> {
        let mut state = self.lock();
        state.enter(ClusterOp::Export, format!("export {namespace}/{kind}"))?;
        if !state.namespaces.contains(namespace) {
            return Err(ClusterError::NotFound(format!("namespace {namespace}")));
        }
        let mut items: Vec<serde_json::Value> = Vec::new();
        if kind == "deployments" {
            let mut names: Vec<_> = state
                .deployments
                .iter()
                .filter(|((ns, _), _)| ns == namespace)
                .collect();
            names.sort_by(|a, b| a.0.1.cmp(&b.0.1));
            for ((_, name), d) in names {
                items.push(serde_json::json!({
                    "name": name,
                    "image": d.image,
                    "replicas": d.desired,
                }));
            }
        }
        Ok(serde_json::json!({ "kind": kind, "namespace": namespace, "items": items }))
    }
}
