//! Rollout controller: drives one target through the rollout state machine.
//!
//! ```text
//! Pending --apply image--> Updating
//! Pending --already on image and available, score >= threshold--> Healthy (no-op)
//! Pending --already on image and available, score < threshold--> Failed(health-gate-failed)
//! Updating --available == desired && Available--> AwaitingHealth
//! Updating --deadline passed--> Failed(rollout-timeout)
//! AwaitingHealth --settle, verify, score >= threshold--> Healthy
//! AwaitingHealth --score < threshold--> RollingBack | Failed(health-gate-failed)
//! ```
//!
//! Each attempt owns its state; nothing is shared between attempts and no
//! cluster reads are reused across polls. Cancellation ends any
//! non-terminal attempt in `Failed(cancelled)`.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use rollgate_cluster::ClusterClient;
use rollgate_core::{
    Deadline, DeploymentTarget, FailureReason, HealthReport, RolloutAttempt, RolloutStatus,
    TargetPolicy, TransitionError,
};
use rollgate_health::HealthCheck;

use crate::poll::{cancelled, is_cancelled, pause, wait_until_ready, WaitError};
use crate::rollback::RollbackController;
use crate::settings::RolloutSettings;

/// Note recorded when the live image already matches.
pub const ALREADY_AT_DESIRED_IMAGE: &str = "already-at-desired-image";

/// Move `attempt` to `next`, logging the transition.
pub(crate) fn advance(
    attempt: &mut RolloutAttempt,
    next: RolloutStatus,
) -> Result<(), TransitionError> {
    let from = attempt.status;
    attempt.transition(next)?;
    info!(target = %attempt.target.name, %from, to = %next, "rollout transition");
    Ok(())
}

/// Move `attempt` to `Failed` with a reason, logging it.
pub(crate) fn fail(
    attempt: &mut RolloutAttempt,
    reason: FailureReason,
    detail: impl Into<String>,
) -> Result<(), TransitionError> {
    let from = attempt.status;
    let detail = detail.into();
    attempt.fail(reason, detail.clone())?;
    warn!(
        target = %attempt.target.name,
        %from,
        %reason,
        %detail,
        "rollout failed"
    );
    Ok(())
}

/// Why a report missed its threshold.
fn gate_detail(report: &HealthReport, threshold: u8) -> String {
    let errored = report.errored();
    if errored.is_empty() {
        format!("score {} < threshold {threshold}", report.score)
    } else {
        let errored: Vec<String> = errored.iter().map(ToString::to_string).collect();
        format!(
            "score {} < threshold {threshold} (could not check: {})",
            report.score,
            errored.join(", ")
        )
    }
}

pub struct RolloutController {
    cluster: Arc<dyn ClusterClient>,
    health: Arc<dyn HealthCheck>,
    rollback: RollbackController,
    settings: RolloutSettings,
}

impl RolloutController {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        health: Arc<dyn HealthCheck>,
        settings: RolloutSettings,
    ) -> Self {
        Self {
            rollback: RollbackController::new(Arc::clone(&cluster), settings),
            cluster,
            health,
            settings,
        }
    }

    pub fn settings(&self) -> &RolloutSettings {
        &self.settings
    }

    /// Roll `target` out to its desired image. Always returns a terminal attempt.
    pub async fn run(
        &self,
        target: DeploymentTarget,
        policy: TargetPolicy,
        mut cancel: watch::Receiver<bool>,
    ) -> RolloutAttempt {
        let mut attempt = RolloutAttempt::new(target, self.settings.rollout_timeout);
        info!(
            target = %attempt.target.name,
            namespace = %attempt.target.namespace,
            image = %attempt.new_image,
            previous_revision = ?attempt.previous_revision,
            threshold = policy.health_threshold,
            "rollout started"
        );

        if let Err(e) = self.drive(&mut attempt, policy, &mut cancel).await {
            error!(target = %attempt.target.name, error = %e, "rollout state machine rejected a transition");
        }
        if !attempt.is_terminal() {
            // Only reachable after a rejected transition.
            let _ = attempt.fail(FailureReason::ClusterError, "rollout ended in a non-terminal state");
        }
        attempt
    }

    async fn drive(
        &self,
        attempt: &mut RolloutAttempt,
        policy: TargetPolicy,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), TransitionError> {
        if is_cancelled(cancel) {
            return fail(attempt, FailureReason::Cancelled, "cancelled before start");
        }
        let target = attempt.target.clone();
        let image = attempt.new_image.clone();

        // ── Pending ────────────────────────────────────────────────
        match self.cluster.get_status(&target).await {
            Ok(status) if status.is_ready() && status.image.as_deref() == Some(image.as_str()) => {
                info!(target = %target.name, %image, "already at desired image, verifying in place");
                attempt.note = Some(ALREADY_AT_DESIRED_IMAGE.to_string());
                return self.gate_in_place(attempt, policy, cancel).await;
            }
            Ok(_) => {
                if attempt.previous_revision.is_none() {
                    self.resolve_previous_revision(attempt).await;
                }
            }
            Err(e) => {
                return fail(
                    attempt,
                    FailureReason::ClusterError,
                    format!("could not read status: {e}"),
                );
            }
        }

        // ── Updating ───────────────────────────────────────────────
        advance(attempt, RolloutStatus::Updating)?;
        let deadline = Deadline::after(self.settings.rollout_timeout);
        if let Err(e) = self.cluster.apply_image(&target, &image).await {
            return fail(attempt, FailureReason::ApplyFailed, e.to_string());
        }

        match wait_until_ready(
            self.cluster.as_ref(),
            &target,
            &image,
            deadline,
            self.settings.poll_interval,
            cancel,
        )
        .await
        {
            Ok(status) => {
                info!(
                    target = %target.name,
                    available = status.available,
                    elapsed = ?deadline.elapsed(),
                    "target available"
                );
            }
            Err(WaitError::Timeout) => {
                return fail(
                    attempt,
                    FailureReason::RolloutTimeout,
                    format!("not available within {:?}", self.settings.rollout_timeout),
                );
            }
            Err(WaitError::Cancelled) => {
                return fail(attempt, FailureReason::Cancelled, "cancelled while updating");
            }
            Err(WaitError::Cluster(e)) => {
                return fail(attempt, FailureReason::ClusterError, e.to_string());
            }
        }

        // ── AwaitingHealth ─────────────────────────────────────────
        advance(attempt, RolloutStatus::AwaitingHealth)?;
        if !pause(self.settings.settle_delay, cancel).await {
            return fail(attempt, FailureReason::Cancelled, "cancelled while settling");
        }
        let Some(report) = self.verify(&target, cancel).await else {
            return fail(attempt, FailureReason::Cancelled, "cancelled during verification");
        };

        let score = report.score;
        let detail = gate_detail(&report, policy.health_threshold);
        attempt.health = Some(report);

        if score >= policy.health_threshold {
            advance(attempt, RolloutStatus::Healthy)?;
            self.record_live_revision(attempt).await;
            info!(
                target = %target.name,
                score,
                revision = ?attempt.target.current_revision,
                "rollout healthy"
            );
            return Ok(());
        }

        if !policy.rollback_enabled {
            return fail(attempt, FailureReason::HealthGateFailed, detail);
        }

        warn!(target = %target.name, %detail, "health gate failed");
        attempt.reason = Some(FailureReason::HealthGateFailed);
        attempt.detail = Some(detail);
        advance(attempt, RolloutStatus::RollingBack)?;
        self.rollback.run(attempt, cancel).await
    }

    /// Gate a target already running the desired image. Nothing was
    /// changed, so a failing score ends `Failed` without a rollback.
    async fn gate_in_place(
        &self,
        attempt: &mut RolloutAttempt,
        policy: TargetPolicy,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), TransitionError> {
        let target = attempt.target.clone();
        let Some(report) = self.verify(&target, cancel).await else {
            return fail(attempt, FailureReason::Cancelled, "cancelled during verification");
        };
        let score = report.score;
        let detail = gate_detail(&report, policy.health_threshold);
        attempt.health = Some(report);

        if score < policy.health_threshold {
            return fail(attempt, FailureReason::HealthGateFailed, detail);
        }
        advance(attempt, RolloutStatus::Healthy)?;
        self.record_live_revision(attempt).await;
        info!(target = %target.name, score, "running image passed the health gate");
        Ok(())
    }

    /// Verify health, re-checking while every category errors.
    ///
    /// Returns `None` if cancelled.
    async fn verify(
        &self,
        target: &DeploymentTarget,
        cancel: &mut watch::Receiver<bool>,
    ) -> Option<HealthReport> {
        let mut attempt = 1;
        loop {
            let report = tokio::select! {
                biased;
                _ = cancelled(cancel) => return None,
                report = self.health.verify(target) => report,
            };
            if !report.is_inconclusive() || attempt >= self.settings.max_verify_attempts {
                return Some(report);
            }
            warn!(
                target = %target.name,
                attempt,
                max = self.settings.max_verify_attempts,
                "every health category errored, verifying again"
            );
            attempt += 1;
            if !pause(self.settings.poll_interval, cancel).await {
                return None;
            }
        }
    }

    /// Fill in the live revision for targets planned without one.
    async fn resolve_previous_revision(&self, attempt: &mut RolloutAttempt) {
        match self.cluster.get_revision_history(&attempt.target).await {
            Ok(history) => {
                let latest = history.last().map(|r| r.number);
                attempt.previous_revision = latest;
                attempt.target.current_revision = latest;
            }
            Err(e) => {
                warn!(target = %attempt.target.name, error = %e, "could not read revision before rollout");
            }
        }
    }

    /// Point `current_revision` at the newest live revision.
    async fn record_live_revision(&self, attempt: &mut RolloutAttempt) {
        match self.cluster.get_revision_history(&attempt.target).await {
            Ok(history) => {
                if let Some(latest) = history.last() {
                    attempt.target.current_revision = Some(latest.number);
                }
            }
            Err(e) => {
                warn!(target = %attempt.target.name, error = %e, "could not read revision after rollout");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use rollgate_cluster::{ClusterError, ClusterOp, InMemoryCluster};
    use rollgate_core::{CategoryOutcome, HealthCategory};

    /// Health check returning queued scores, then repeating the last.
    struct Scores {
        queue: Mutex<Vec<HealthReport>>,
        calls: Mutex<u32>,
    }

    impl Scores {
        fn new(reports: Vec<HealthReport>) -> Arc<Self> {
            Arc::new(Self {
                queue: Mutex::new(reports),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl HealthCheck for Scores {
        async fn verify(&self, _target: &DeploymentTarget) -> HealthReport {
            *self.calls.lock().unwrap() += 1;
            let mut queue = self.queue.lock().unwrap();
            if queue.len() > 1 {
                queue.remove(0)
            } else {
                queue[0].clone()
            }
        }
    }

    fn report(pass: usize, fail: usize) -> HealthReport {
        let all = [HealthCategory::Liveness, HealthCategory::Api, HealthCategory::Channel];
        let mut categories = BTreeMap::new();
        for (i, category) in all.iter().take(pass + fail).enumerate() {
            let outcome = if i < pass {
                CategoryOutcome::Pass
            } else {
                CategoryOutcome::Fail("503".into())
            };
            categories.insert(*category, outcome);
        }
        HealthReport::from_results("backend", categories)
    }

    fn all_errors() -> HealthReport {
        let mut categories = BTreeMap::new();
        categories.insert(HealthCategory::Liveness, CategoryOutcome::Error("refused".into()));
        HealthReport::from_results("backend", categories)
    }

    fn cluster() -> Arc<InMemoryCluster> {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_deployment("prod", "backend", "reg/backend:v1", 2);
        cluster.set_ready_after("prod", "backend", 2);
        cluster
    }

    fn target() -> DeploymentTarget {
        let mut target = DeploymentTarget::new("backend", "prod", "reg/backend:v2", 2);
        target.current_revision = Some(1);
        target
    }

    fn policy(threshold: u8, rollback_enabled: bool) -> TargetPolicy {
        TargetPolicy {
            health_threshold: threshold,
            rollback_enabled,
        }
    }

    /// A receiver whose sender is gone never reports cancellation.
    fn no_cancel() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_rollout_advances_revision() {
        let cluster = cluster();
        let health = Scores::new(vec![report(3, 0)]);
        let controller = RolloutController::new(cluster.clone(), health, RolloutSettings::default());

        let attempt = controller.run(target(), policy(80, true), no_cancel()).await;

        assert_eq!(attempt.status, RolloutStatus::Healthy);
        assert_eq!(attempt.target.current_revision, Some(2));
        assert_eq!(attempt.previous_revision, Some(1));
        assert_eq!(attempt.health.as_ref().map(|r| r.score), Some(100));
        let path: Vec<_> = attempt.history.iter().map(|t| t.to).collect();
        assert_eq!(
            path,
            [
                RolloutStatus::Updating,
                RolloutStatus::AwaitingHealth,
                RolloutStatus::Healthy
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn settle_delay_precedes_verification() {
        let cluster = cluster();
        cluster.set_ready_after("prod", "backend", 1);
        let health = Scores::new(vec![report(1, 0)]);
        let controller = RolloutController::new(cluster, health, RolloutSettings::default());

        let start = tokio::time::Instant::now();
        controller.run(target(), policy(50, true), no_cancel()).await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn score_below_threshold_rolls_back() {
        let cluster = cluster();
        let mut scored = report(2, 1);
        scored.score = 60;
        let health = Scores::new(vec![scored]);
        let controller = RolloutController::new(cluster.clone(), health, RolloutSettings::default());

        let attempt = controller.run(target(), policy(80, true), no_cancel()).await;

        assert_eq!(attempt.status, RolloutStatus::RolledBack);
        assert_eq!(attempt.reason, Some(FailureReason::HealthGateFailed));
        assert!(attempt.history.iter().any(|t| t.to == RolloutStatus::RollingBack));
        assert!(!attempt.history.iter().any(|t| t.to == RolloutStatus::Healthy));
        assert_eq!(attempt.target.current_revision, Some(1));
        assert_eq!(
            cluster.current_image("prod", "backend").as_deref(),
            Some("reg/backend:v1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_gate_without_rollback_fails() {
        let cluster = cluster();
        let health = Scores::new(vec![report(0, 2)]);
        let controller = RolloutController::new(cluster.clone(), health, RolloutSettings::default());

        let attempt = controller.run(target(), policy(50, false), no_cancel()).await;

        assert_eq!(attempt.status, RolloutStatus::Failed);
        assert_eq!(attempt.reason, Some(FailureReason::HealthGateFailed));
        assert_eq!(cluster.call_count(ClusterOp::Rollback), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn never_available_times_out_without_rollback() {
        let cluster = cluster();
        cluster.mark_never_ready("reg/backend:v2");
        let health = Scores::new(vec![report(3, 0)]);
        let controller =
            RolloutController::new(cluster.clone(), health.clone(), RolloutSettings::default());

        let start = tokio::time::Instant::now();
        let attempt = controller.run(target(), policy(80, true), no_cancel()).await;

        assert_eq!(attempt.status, RolloutStatus::Failed);
        assert_eq!(attempt.reason, Some(FailureReason::RolloutTimeout));
        assert!(start.elapsed() <= Duration::from_secs(601));
        assert_eq!(health.calls(), 0);
        assert_eq!(cluster.call_count(ClusterOp::Rollback), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn already_at_image_is_a_noop() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_deployment("prod", "backend", "reg/backend:v2", 2);
        let health = Scores::new(vec![report(3, 0)]);
        let controller =
            RolloutController::new(cluster.clone(), health.clone(), RolloutSettings::default());

        let start = tokio::time::Instant::now();
        let attempt = controller.run(target(), policy(80, true), no_cancel()).await;

        assert_eq!(attempt.status, RolloutStatus::Healthy);
        assert_eq!(attempt.note.as_deref(), Some(ALREADY_AT_DESIRED_IMAGE));
        assert_eq!(attempt.health.as_ref().map(|r| r.score), Some(100));
        assert_eq!(cluster.call_count(ClusterOp::Apply), 0);
        assert_eq!(health.calls(), 1);
        // No settle delay when nothing was changed.
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_running_image_is_not_promoted() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_deployment("prod", "backend", "reg/backend:v2", 2);
        let health = Scores::new(vec![report(0, 3)]);
        let controller =
            RolloutController::new(cluster.clone(), health.clone(), RolloutSettings::default());

        let attempt = controller.run(target(), policy(80, true), no_cancel()).await;

        assert_eq!(attempt.status, RolloutStatus::Failed);
        assert_eq!(attempt.reason, Some(FailureReason::HealthGateFailed));
        assert_eq!(attempt.health.as_ref().map(|r| r.score), Some(0));
        assert_eq!(attempt.target.current_revision, Some(1));
        assert_eq!(cluster.call_count(ClusterOp::Apply), 0);
        assert_eq!(cluster.call_count(ClusterOp::Rollback), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_apply_fails() {
        let cluster = cluster();
        cluster.inject(ClusterOp::Apply, ClusterError::Rejected("invalid image".into()));
        let controller =
            RolloutController::new(cluster, Scores::new(vec![report(3, 0)]), RolloutSettings::default());

        let attempt = controller.run(target(), policy(80, true), no_cancel()).await;

        assert_eq!(attempt.reason, Some(FailureReason::ApplyFailed));
        assert_eq!(attempt.target.current_revision, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn inconclusive_reports_are_retried_then_gated() {
        let cluster = cluster();
        let health = Scores::new(vec![all_errors()]);
        let controller =
            RolloutController::new(cluster, health.clone(), RolloutSettings::default());

        let attempt = controller.run(target(), policy(80, true), no_cancel()).await;

        assert_eq!(health.calls(), 3);
        assert_eq!(attempt.status, RolloutStatus::RolledBack);
    }

    #[tokio::test(start_paused = true)]
    async fn inconclusive_then_passing_is_healthy() {
        let cluster = cluster();
        let health = Scores::new(vec![all_errors(), report(3, 0)]);
        let controller =
            RolloutController::new(cluster, health.clone(), RolloutSettings::default());

        let attempt = controller.run(target(), policy(80, true), no_cancel()).await;

        assert_eq!(health.calls(), 2);
        assert_eq!(attempt.status, RolloutStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_while_updating_fails_cancelled() {
        let cluster = cluster();
        cluster.mark_never_ready("reg/backend:v2");
        let controller =
            RolloutController::new(cluster, Scores::new(vec![report(3, 0)]), RolloutSettings::default());
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(45)).await;
            let _ = tx.send(true);
        });

        let start = tokio::time::Instant::now();
        let attempt = controller.run(target(), policy(80, true), rx).await;

        assert_eq!(attempt.status, RolloutStatus::Failed);
        assert_eq!(attempt.reason, Some(FailureReason::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_cluster_fails_without_mutation() {
        let cluster = cluster();
        cluster.set_unreachable(true);
        let controller = RolloutController::new(
            cluster.clone(),
            Scores::new(vec![report(3, 0)]),
            RolloutSettings::default(),
        );

        let attempt = controller.run(target(), policy(80, true), no_cancel()).await;

        assert_eq!(attempt.reason, Some(FailureReason::ClusterError));
        assert_eq!(cluster.call_count(ClusterOp::Apply), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_revision_is_read_from_history() {
        let cluster = cluster();
        let controller = RolloutController::new(
            cluster,
            Scores::new(vec![report(3, 0)]),
            RolloutSettings::default(),
        );
        let target = DeploymentTarget::new("backend", "prod", "reg/backend:v2", 2);

        let attempt = controller.run(target, policy(80, true), no_cancel()).await;

        assert_eq!(attempt.previous_revision, Some(1));
        assert_eq!(attempt.target.current_revision, Some(2));
    }
}
