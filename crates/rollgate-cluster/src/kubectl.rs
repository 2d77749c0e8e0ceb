//! `kubectl`-backed control plane client.
//!
//! Every call shells out to `kubectl ... -o json` and parses the result,
//! so nothing is cached between calls. Revision history is derived from
//! the ReplicaSets a Deployment owns, which carry the
//! `deployment.kubernetes.io/revision` annotation.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use rollgate_core::{DeploymentTarget, Revision};

use crate::client::{ClusterClient, ClusterError, ClusterResult, ClusterStatus};

const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// Client that drives a Kubernetes control plane through `kubectl`.
#[derive(Debug, Clone)]
pub struct KubectlClient {
    binary: PathBuf,
    context: Option<String>,
    call_timeout: Duration,
}

impl Default for KubectlClient {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("kubectl"),
            context: None,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl KubectlClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    /// Upper bound on a single kubectl invocation.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    async fn run(&self, namespace: Option<&str>, args: &[&str]) -> ClusterResult<String> {
        let mut cmd = Command::new(&self.binary);
        if let Some(context) = &self.context {
            cmd.args(["--context", context.as_str()]);
        }
        if let Some(ns) = namespace {
            cmd.args(["--namespace", ns]);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(binary = ?self.binary, ?namespace, ?args, "running kubectl");

        let output = tokio::time::timeout(self.call_timeout, cmd.output())
            .await
            .map_err(|_| {
                ClusterError::Connectivity(format!(
                    "kubectl {} timed out after {:?}",
                    args.first().unwrap_or(&""),
                    self.call_timeout
                ))
            })?
            .map_err(|e| ClusterError::Connectivity(format!("failed to run kubectl: {e}")))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_stderr(&String::from_utf8_lossy(&output.stderr)))
        }
    }

    async fn run_json(&self, namespace: Option<&str>, args: &[&str]) -> ClusterResult<Value> {
        let out = self.run(namespace, args).await?;
        serde_json::from_str(&out).map_err(|e| ClusterError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl ClusterClient for KubectlClient {
    async fn check_namespace(&self, namespace: &str) -> ClusterResult<()> {
        let ns = format!("namespace/{namespace}");
        self.run(None, &["get", ns.as_str(), "-o", "name"]).await?;
        Ok(())
    }

    async fn apply_image(&self, target: &DeploymentTarget, image: &str) -> ClusterResult<()> {
        let resource = format!("deployment/{}", target.deployment);
        let assignment = format!("{}={image}", target.container);
        self.run(
            Some(target.namespace.as_str()),
            &["set", "image", resource.as_str(), assignment.as_str()],
        )
        .await?;
        Ok(())
    }

    async fn get_status(&self, target: &DeploymentTarget) -> ClusterResult<ClusterStatus> {
        let doc = self
            .run_json(
                Some(target.namespace.as_str()),
                &["get", "deployment", target.deployment.as_str(), "-o", "json"],
            )
            .await?;
        Ok(parse_deployment_status(&doc, &target.container))
    }

    async fn get_revision_history(&self, target: &DeploymentTarget) -> ClusterResult<Vec<Revision>> {
        let doc = self
            .run_json(Some(target.namespace.as_str()), &["get", "replicasets", "-o", "json"])
            .await?;
        Ok(parse_revision_history(&doc, &target.deployment, &target.container))
    }

    async fn rollback_to(&self, target: &DeploymentTarget, revision: u64) -> ClusterResult<()> {
        let resource = format!("deployment/{}", target.deployment);
        let to = format!("--to-revision={revision}");
        self.run(
            Some(target.namespace.as_str()),
            &["rollout", "undo", resource.as_str(), to.as_str()],
        )
        .await?;
        Ok(())
    }

    async fn export_resources(&self, namespace: &str, kind: &str) -> ClusterResult<Value> {
        self.run_json(Some(namespace), &["get", kind, "-o", "json"]).await
    }
}

/// Map kubectl's stderr onto the error taxonomy.
pub fn classify_stderr(stderr: &str) -> ClusterError {
    let lower = stderr.to_lowercase();
    let message = stderr.trim().to_string();
    if lower.contains("notfound") || lower.contains("not found") {
        ClusterError::NotFound(message)
    } else if lower.contains("the object has been modified") || lower.contains("conflict") {
        ClusterError::Conflict(message)
    } else if [
        "unable to connect",
        "connection refused",
        "i/o timeout",
        "tls handshake timeout",
        "service unavailable",
        "no route to host",
        "eof",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
    {
        ClusterError::Connectivity(message)
    } else {
        ClusterError::Rejected(message)
    }
}

/// Extract replica counts, the Available condition, and the container image.
///
/// Only replicas of the newest template count as available, and nothing
/// counts until the controller has observed the latest generation. Old pods
/// keep `availableReplicas` and `Available=True` up while a rollout starts.
pub fn parse_deployment_status(doc: &Value, container: &str) -> ClusterStatus {
    let desired = doc["spec"]["replicas"].as_u64().unwrap_or(1) as u32;
    let generation = doc["metadata"]["generation"].as_u64().unwrap_or(0);
    let observed = doc["status"]["observedGeneration"].as_u64().unwrap_or(0);
    let updated = doc["status"]["updatedReplicas"].as_u64().unwrap_or(0) as u32;
    let available = if observed < generation {
        0
    } else {
        (doc["status"]["availableReplicas"].as_u64().unwrap_or(0) as u32).min(updated)
    };
    let condition_available = doc["status"]["conditions"]
        .as_array()
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c["type"] == "Available" && c["status"] == "True")
        })
        .unwrap_or(false);
    let image = container_image(&doc["spec"]["template"], container);

    ClusterStatus {
        available,
        desired,
        condition_available,
        image,
    }
}

/// Revisions of the ReplicaSets owned by `deployment`, oldest first.
pub fn parse_revision_history(doc: &Value, deployment: &str, container: &str) -> Vec<Revision> {
    let mut revisions: Vec<Revision> = doc["items"]
        .as_array()
        .into_iter()
        .flatten()
        .filter(|rs| owned_by(rs, deployment))
        .filter_map(|rs| {
            let number = rs["metadata"]["annotations"][REVISION_ANNOTATION]
                .as_str()?
                .parse::<u64>()
                .ok()?;
            let image = container_image(&rs["spec"]["template"], container).unwrap_or_default();
            Some(Revision { number, image })
        })
        .collect();
    revisions.sort_by_key(|r| r.number);
    revisions
}

fn owned_by(rs: &Value, deployment: &str) -> bool {
    rs["metadata"]["ownerReferences"]
        .as_array()
        .map(|owners| {
            owners
                .iter()
                .any(|o| o["kind"] == "Deployment" && o["name"] == deployment)
        })
        .unwrap_or(false)
}

/// Image of `container` in a pod template, falling back to the first container.
fn container_image(template: &Value, container: &str) -> Option<String> {
    let containers = template["spec"]["containers"].as_array()?;
    containers
        .iter()
        .find(|c| c["name"] == container)
        .or_else(|| containers.first())
        .and_then(|c| c["image"].as_str())
        .map(str::to_string)
}
