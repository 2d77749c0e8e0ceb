//! Deployment sequencer: the supervisor for one run.
//!
//! ```text
//! prerequisites (namespace reachable)      -> SequencerError::Prerequisite
//! backup once per run (unless disabled)    -> SequencerError::Backup unless forced
//! for each target in plan order:
//!     lock target, RolloutController::run
//!     Healthy            -> next
//!     RolledBack/Failed  -> abort (remaining Skipped) | continue (best-effort)
//! aggregate health check over Healthy targets
//! classify outcome
//! ```
//!
//! Nothing is mutated before prerequisites and the backup succeed.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use rollgate_backup::{BackupError, BackupStore};
use rollgate_cluster::{ClusterClient, ClusterError};
use rollgate_core::{
    epoch_secs, DeploymentPlan, DeploymentTarget, FailurePolicy, FailureReason, HealthReport,
    RolloutAttempt,
};
use rollgate_health::HealthCheck;

use crate::controller::{fail, RolloutController};
use crate::lock::RolloutLocks;
use crate::poll::{cancelled, is_cancelled};
use crate::report::{AggregateCheck, BackupOutcome, RunOutcome, RunReport, TargetReport, TargetStatus};
use crate::settings::RolloutSettings;

/// Hard failures raised before any target is touched.
#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("prerequisite failed for namespace {namespace}: {source}")]
    Prerequisite {
        namespace: String,
        #[source]
        source: ClusterError,
    },

    #[error("backup failed, refusing to deploy without a snapshot: {0}")]
    Backup(#[source] BackupError),
}

/// Inputs for one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub environment: String,
    pub namespace: String,
    pub deployment_type: String,
    pub plan: DeploymentPlan,
    pub backup_scope: BTreeSet<String>,
    /// Proceed even if the snapshot fails.
    pub force_backup: bool,
}

pub struct Sequencer {
    cluster: Arc<dyn ClusterClient>,
    health: Arc<dyn HealthCheck>,
    controller: RolloutController,
    backup: Option<Arc<dyn BackupStore>>,
    locks: RolloutLocks,
}

impl Sequencer {
    /// A sequencer with backups disabled.
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        health: Arc<dyn HealthCheck>,
        settings: RolloutSettings,
    ) -> Self {
        Self {
            controller: RolloutController::new(Arc::clone(&cluster), Arc::clone(&health), settings),
            cluster,
            health,
            backup: None,
            locks: RolloutLocks::new(),
        }
    }

    pub fn with_backup(mut self, store: Arc<dyn BackupStore>) -> Self {
        self.backup = Some(store);
        self
    }

    /// Share locks with other sequencers in the same process.
    pub fn with_locks(mut self, locks: RolloutLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn locks(&self) -> &RolloutLocks {
        &self.locks
    }

    pub async fn run(
        &self,
        request: RunRequest,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunReport, SequencerError> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = epoch_secs();
        info!(
            %run_id,
            environment = %request.environment,
            deployment_type = %request.deployment_type,
            targets = request.plan.len(),
            policy = ?request.plan.failure_policy,
            "deployment run started"
        );

        // ── Prerequisites ──────────────────────────────────────────
        let mut namespaces: BTreeSet<&str> = BTreeSet::from([request.namespace.as_str()]);
        namespaces.extend(request.plan.entries().iter().map(|e| e.target.namespace.as_str()));
        for namespace in namespaces {
            if let Err(source) = self.cluster.check_namespace(namespace).await {
                error!(%run_id, %namespace, error = %source, "prerequisite check failed");
                return Err(SequencerError::Prerequisite {
                    namespace: namespace.to_string(),
                    source,
                });
            }
        }

        // ── Backup ─────────────────────────────────────────────────
        let backup = match &self.backup {
            None => {
                warn!(%run_id, "backups disabled by configuration, proceeding without a snapshot");
                BackupOutcome::Skipped {
                    reason: "disabled by configuration".to_string(),
                }
            }
            Some(store) => match store.snapshot(&request.namespace, &request.backup_scope).await {
                Ok(record) => BackupOutcome::Completed { record },
                Err(e) if request.force_backup => {
                    warn!(%run_id, error = %e, "backup failed, continuing because it was forced");
                    BackupOutcome::Forced {
                        error: e.to_string(),
                    }
                }
                Err(e) => {
                    error!(%run_id, error = %e, "backup failed, aborting before any mutation");
                    return Err(SequencerError::Backup(e));
                }
            },
        };

        // ── Targets ────────────────────────────────────────────────
        let policy = request.plan.failure_policy;
        let mut targets = Vec::with_capacity(request.plan.len());
        let mut thresholds: HashMap<String, u8> = HashMap::new();
        let mut healthy: Vec<DeploymentTarget> = Vec::new();
        let mut stop: Option<String> = None;

        for entry in request.plan.into_entries() {
            if stop.is_none() && is_cancelled(&cancel) {
                stop = Some("run cancelled".to_string());
            }
            if let Some(why) = &stop {
                info!(%run_id, target = %entry.target.name, "target skipped");
                targets.push(TargetReport::skipped(&entry.target, why));
                continue;
            }

            let attempt = match self.locks.try_acquire(&entry.target.lock_key()) {
                Some(_guard) => {
                    self.controller
                        .run(entry.target.clone(), entry.policy, cancel.clone())
                        .await
                }
                None => in_progress(entry.target.clone(), self.controller.settings()),
            };

            let report = TargetReport::from_attempt(&attempt);
            info!(
                %run_id,
                target = %report.name,
                status = report.status.label(),
                reason = ?report.reason,
                "target finished"
            );

            if report.status == TargetStatus::Healthy {
                thresholds.insert(attempt.target.name.clone(), entry.policy.health_threshold);
                healthy.push(attempt.target.clone());
            } else if attempt.reason == Some(FailureReason::Cancelled) {
                stop = Some("run cancelled".to_string());
            } else if policy == FailurePolicy::AbortOnFirstFailure {
                warn!(%run_id, target = %report.name, "aborting run after failed target");
                stop = Some(format!("run aborted after {} failed", report.name));
            }
            targets.push(report);
        }

        // ── Aggregate check ────────────────────────────────────────
        let aggregate = if healthy.is_empty() || is_cancelled(&cancel) {
            None
        } else {
            self.aggregate_check(&healthy, &thresholds, cancel.clone()).await
        };

        let outcome = RunOutcome::classify(&targets, aggregate.as_ref());
        let report = RunReport {
            run_id,
            environment: request.environment,
            namespace: request.namespace,
            deployment_type: request.deployment_type,
            outcome,
            backup,
            targets,
            aggregate,
            started_at,
            finished_at: epoch_secs(),
        };
        info!(
            run_id = %report.run_id,
            outcome = report.outcome.label(),
            "deployment run finished"
        );
        Ok(report)
    }

    /// Re-verify every healthy target together, after all rollouts.
    /// Returns `None` if the run is cancelled part way.
    async fn aggregate_check(
        &self,
        healthy: &[DeploymentTarget],
        thresholds: &HashMap<String, u8>,
        mut cancel: watch::Receiver<bool>,
    ) -> Option<AggregateCheck> {
        let mut reports: Vec<HealthReport> = Vec::with_capacity(healthy.len());
        let mut failed_targets = Vec::new();
        for target in healthy {
            let report = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => {
                    warn!(target = %target.name, "run cancelled during aggregate check");
                    return None;
                }
                report = self.health.verify(target) => report,
            };
            let threshold = thresholds.get(&target.name).copied().unwrap_or(100);
            if !report.meets(threshold) {
                warn!(
                    target = %target.name,
                    score = report.score,
                    threshold,
                    "aggregate check failed for target"
                );
                failed_targets.push(target.name.clone());
            }
            reports.push(report);
        }
        let passed = failed_targets.is_empty();
        info!(targets = healthy.len(), passed, "aggregate health check complete");
        Some(AggregateCheck {
            passed,
            reports,
            failed_targets,
        })
    }
}

/// A terminal attempt for a target another rollout already holds.
fn in_progress(target: DeploymentTarget, settings: &RolloutSettings) -> RolloutAttempt {
    let mut attempt = RolloutAttempt::new(target, settings.rollout_timeout);
    if let Err(e) = fail(
        &mut attempt,
        FailureReason::RolloutInProgress,
        "another rollout holds this target",
    ) {
        error!(error = %e, "could not record rollout-in-progress");
    }
    attempt
}
