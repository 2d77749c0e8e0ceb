//! Domain types shared across rollgate crates.
//!
//! These types describe what is being deployed (`DeploymentTarget`,
//! `DeploymentPlan`), the lifecycle of a single rollout (`RolloutAttempt`),
//! and the evidence gathered along the way (`HealthReport`, `BackupRecord`).
//! All of them serialize to JSON so they can be embedded in run reports.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PlanError, TransitionError};

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Targets ────────────────────────────────────────────────────────

/// One deployable service in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentTarget {
    /// Logical service name (e.g. "backend").
    pub name: String,
    pub namespace: String,
    /// Name of the deployment object in the control plane.
    pub deployment: String,
    /// Container within the deployment whose image is updated.
    pub container: String,
    pub desired_image: String,
    /// Revision currently considered live. Advances only after a healthy rollout.
    pub current_revision: Option<u64>,
    pub replica_count: u32,
}

impl DeploymentTarget {
    /// Create a target whose deployment and container share its name.
    pub fn new(name: &str, namespace: &str, desired_image: &str, replica_count: u32) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            deployment: name.to_string(),
            container: name.to_string(),
            desired_image: desired_image.to_string(),
            current_revision: None,
            replica_count,
        }
    }

    /// Key used to serialize rollouts on the same target.
    pub fn lock_key(&self) -> String {
        format!("{}/{}", self.namespace, self.deployment)
    }
}

/// An addressable historical version of a target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Revision {
    pub number: u64,
    pub image: String,
}

// ── Rollout attempts ───────────────────────────────────────────────

/// Lifecycle of a single `RolloutAttempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Pending,
    Updating,
    AwaitingHealth,
    Healthy,
    RollingBack,
    RolledBack,
    Failed,
}

impl RolloutStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RolloutStatus::Healthy | RolloutStatus::RolledBack | RolloutStatus::Failed
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            RolloutStatus::Pending => "pending",
            RolloutStatus::Updating => "updating",
            RolloutStatus::AwaitingHealth => "awaiting-health",
            RolloutStatus::Healthy => "healthy",
            RolloutStatus::RollingBack => "rolling-back",
            RolloutStatus::RolledBack => "rolled-back",
            RolloutStatus::Failed => "failed",
        }
    }

    /// Whether the state machine has an edge `self -> next`.
    fn allows(self, next: RolloutStatus) -> bool {
        use RolloutStatus::*;
        match (self, next) {
            (Pending, Updating) => true,
            // Live image already matches: nothing to roll out.
            (Pending, Healthy) => true,
            (Updating, AwaitingHealth) => true,
            (AwaitingHealth, Healthy) => true,
            (AwaitingHealth, RollingBack) => true,
            (RollingBack, RolledBack) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why an attempt did not end `Healthy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    RolloutTimeout,
    ApplyFailed,
    ClusterError,
    HealthGateFailed,
    NoRollbackTarget,
    /// The revert itself failed; the target needs manual intervention.
    RollbackFailed,
    Cancelled,
    RolloutInProgress,
    NotAttempted,
}

impl FailureReason {
    pub fn code(self) -> &'static str {
        match self {
            FailureReason::RolloutTimeout => "rollout-timeout",
            FailureReason::ApplyFailed => "apply-failed",
            FailureReason::ClusterError => "cluster-error",
            FailureReason::HealthGateFailed => "health-gate-failed",
            FailureReason::NoRollbackTarget => "no-rollback-target",
            FailureReason::RollbackFailed => "rollback-failed",
            FailureReason::Cancelled => "cancelled",
            FailureReason::RolloutInProgress => "rollout-in-progress",
            FailureReason::NotAttempted => "not-attempted",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A recorded state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transition {
    pub from: RolloutStatus,
    pub to: RolloutStatus,
    pub at: u64,
}

/// One attempt to move a target to a new image.
///
/// Owned exclusively by the controller driving it until it reaches a
/// terminal status and is handed back to the sequencer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutAttempt {
    pub target: DeploymentTarget,
    /// Revision live before this attempt started.
    pub previous_revision: Option<u64>,
    pub new_image: String,
    pub started_at: u64,
    /// Epoch second after which the rollout phase is considered timed out.
    pub deadline: u64,
    pub status: RolloutStatus,
    pub reason: Option<FailureReason>,
    /// Free-form context for `reason` (error text, scores).
    pub detail: Option<String>,
    /// Informational remark that is not a failure (e.g. no-op rollout).
    pub note: Option<String>,
    /// Health report that decided the gate, if one ran.
    pub health: Option<HealthReport>,
    pub history: Vec<Transition>,
}

impl RolloutAttempt {
    pub fn new(target: DeploymentTarget, rollout_timeout: Duration) -> Self {
        let started_at = epoch_secs();
        Self {
            previous_revision: target.current_revision,
            new_image: target.desired_image.clone(),
            target,
            started_at,
            deadline: started_at + rollout_timeout.as_secs(),
            status: RolloutStatus::Pending,
            reason: None,
            detail: None,
            note: None,
            health: None,
            history: Vec::new(),
        }
    }

    /// Move to `next`, rejecting edges the state machine does not have.
    pub fn transition(&mut self, next: RolloutStatus) -> Result<(), TransitionError> {
        if !self.status.allows(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.history.push(Transition {
            from: self.status,
            to: next,
            at: epoch_secs(),
        });
        self.status = next;
        Ok(())
    }

    /// Move to `Failed` and record why.
    pub fn fail(
        &mut self,
        reason: FailureReason,
        detail: impl Into<String>,
    ) -> Result<(), TransitionError> {
        self.transition(RolloutStatus::Failed)?;
        self.reason = Some(reason);
        self.detail = Some(detail.into());
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ── Health ─────────────────────────────────────────────────────────

/// A family of checks run against a deployed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCategory {
    /// Liveness endpoint reachability.
    Liveness,
    /// A dependent API-layer call.
    Api,
    /// Bidirectional channel (WebSocket) round trip.
    Channel,
}

impl fmt::Display for HealthCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthCategory::Liveness => "liveness",
            HealthCategory::Api => "api",
            HealthCategory::Channel => "channel",
        })
    }
}

/// Result of one category. `Error` means the check could not be performed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum CategoryOutcome {
    Pass,
    Fail(String),
    Error(String),
}

impl CategoryOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, CategoryOutcome::Pass)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CategoryOutcome::Error(_))
    }
}

/// Composite health of one target at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub target: String,
    /// Percentage of categories that passed (0-100).
    pub score: u8,
    pub categories: BTreeMap<HealthCategory, CategoryOutcome>,
    pub measured_at: u64,
}

impl HealthReport {
    /// Build a report, scoring `error` categories as failed.
    pub fn from_results(
        target: &str,
        categories: BTreeMap<HealthCategory, CategoryOutcome>,
    ) -> Self {
        let checked = categories.len();
        let passed = categories.values().filter(|o| o.is_pass()).count();
        let score = if checked == 0 {
            0
        } else {
            (passed * 100 / checked) as u8
        };
        Self {
            target: target.to_string(),
            score,
            categories,
            measured_at: epoch_secs(),
        }
    }

    pub fn meets(&self, threshold: u8) -> bool {
        self.score >= threshold
    }

    /// Categories that could not be checked at all.
    pub fn errored(&self) -> Vec<HealthCategory> {
        self.categories
            .iter()
            .filter(|(_, o)| o.is_error())
            .map(|(c, _)| *c)
            .collect()
    }

    /// True when nothing could be checked, so the score carries no signal.
    pub fn is_inconclusive(&self) -> bool {
        !self.categories.is_empty() && self.categories.values().all(CategoryOutcome::is_error)
    }
}

// ── Backups ────────────────────────────────────────────────────────

/// A pre-deployment snapshot. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupRecord {
    pub id: String,
    pub timestamp: u64,
    pub namespace: String,
    /// Resource kinds captured.
    pub scope: BTreeSet<String>,
    /// Local directory holding the snapshot.
    pub storage_location: String,
    /// Remote copy, if the optional upload succeeded.
    pub remote_location: Option<String>,
}

// ── Plans ──────────────────────────────────────────────────────────

/// What the sequencer does after a target fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop the run; remaining targets are reported as skipped.
    #[default]
    AbortOnFirstFailure,
    /// Continue with the next target regardless.
    BestEffort,
}

/// Per-target promotion policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPolicy {
    /// Minimum composite score required to promote.
    pub health_threshold: u8,
    pub rollback_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub target: DeploymentTarget,
    pub policy: TargetPolicy,
}

/// Ordered targets plus the failure policy for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    entries: Vec<PlanEntry>,
    pub failure_policy: FailurePolicy,
}

impl DeploymentPlan {
    /// Build a plan. Targets are deployed in the order given.
    pub fn new(entries: Vec<PlanEntry>, failure_policy: FailurePolicy) -> Result<Self, PlanError> {
        if entries.is_empty() {
            return Err(PlanError::Empty);
        }
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.target.lock_key()) {
                return Err(PlanError::DuplicateTarget(entry.target.name.clone()));
            }
            if entry.policy.health_threshold > 100 {
                return Err(PlanError::InvalidThreshold {
                    target: entry.target.name.clone(),
                    threshold: entry.policy.health_threshold,
                });
            }
        }
        Ok(Self {
            entries,
            failure_policy,
        })
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<PlanEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
