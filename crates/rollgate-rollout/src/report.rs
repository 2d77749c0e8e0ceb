//! Run results: the machine-readable report and its human summary.

use serde::{Deserialize, Serialize};

use rollgate_core::{
    BackupRecord, DeploymentTarget, FailureReason, HealthCategory, HealthReport, RolloutAttempt,
    RolloutStatus, Transition,
};

/// Terminal status of one target in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetStatus {
    Healthy,
    /// Partial success: the target failed but was returned to a working revision.
    RolledBack,
    Failed,
    /// Not attempted because the run stopped first.
    Skipped,
}

impl TargetStatus {
    pub fn label(self) -> &'static str {
        match self {
            TargetStatus::Healthy => "healthy",
            TargetStatus::RolledBack => "rolled-back",
            TargetStatus::Failed => "failed",
            TargetStatus::Skipped => "skipped",
        }
    }

    fn icon(self) -> &'static str {
        match self {
            TargetStatus::Healthy => "✅",
            TargetStatus::RolledBack => "↩️ ",
            TargetStatus::Failed => "❌",
            TargetStatus::Skipped => "⏭️ ",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetReport {
    pub name: String,
    pub namespace: String,
    pub status: TargetStatus,
    pub reason: Option<FailureReason>,
    pub detail: Option<String>,
    pub note: Option<String>,
    pub image: String,
    pub previous_revision: Option<u64>,
    /// Revision live after the run, as known to the orchestrator.
    pub current_revision: Option<u64>,
    pub health_score: Option<u8>,
    pub errored_categories: Vec<HealthCategory>,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    pub transitions: Vec<Transition>,
}

impl TargetReport {
    /// Report a finished attempt.
    pub fn from_attempt(attempt: &RolloutAttempt) -> Self {
        let status = match attempt.status {
            RolloutStatus::Healthy => TargetStatus::Healthy,
            RolloutStatus::RolledBack => TargetStatus::RolledBack,
            _ => TargetStatus::Failed,
        };
        Self {
            name: attempt.target.name.clone(),
            namespace: attempt.target.namespace.clone(),
            status,
            reason: attempt.reason,
            detail: attempt.detail.clone(),
            note: attempt.note.clone(),
            image: attempt.new_image.clone(),
            previous_revision: attempt.previous_revision,
            current_revision: attempt.target.current_revision,
            health_score: attempt.health.as_ref().map(|h| h.score),
            errored_categories: attempt
                .health
                .as_ref()
                .map(HealthReport::errored)
                .unwrap_or_default(),
            started_at: Some(attempt.started_at),
            finished_at: attempt.history.last().map(|t| t.at),
            transitions: attempt.history.clone(),
        }
    }

    /// Report a target the run never reached.
    pub fn skipped(target: &DeploymentTarget, detail: &str) -> Self {
        Self {
            name: target.name.clone(),
            namespace: target.namespace.clone(),
            status: TargetStatus::Skipped,
            reason: Some(FailureReason::NotAttempted),
            detail: Some(detail.to_string()),
            note: None,
            image: target.desired_image.clone(),
            previous_revision: target.current_revision,
            current_revision: target.current_revision,
            health_score: None,
            errored_categories: Vec::new(),
            started_at: None,
            finished_at: None,
            transitions: Vec::new(),
        }
    }
}

/// What happened to the pre-deployment backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum BackupOutcome {
    Completed { record: BackupRecord },
    /// Disabled by configuration.
    Skipped { reason: String },
    /// Snapshot failed and the operator forced the run anyway.
    Forced { error: String },
}

impl BackupOutcome {
    fn summary(&self) -> String {
        match self {
            BackupOutcome::Completed { record } => {
                format!("{} ({})", record.id, record.storage_location)
            }
            BackupOutcome::Skipped { reason } => format!("skipped: {reason}"),
            BackupOutcome::Forced { error } => format!("FAILED, forced: {error}"),
        }
    }
}

/// Final cross-service verification of every healthy target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateCheck {
    pub passed: bool,
    pub reports: Vec<HealthReport>,
    /// Targets whose fresh score fell below their threshold.
    pub failed_targets: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunOutcome {
    Success,
    /// Some targets rolled back, failed, or were skipped.
    PartialFailure,
    /// The aggregate check failed despite individually healthy targets.
    Failure,
}

impl RunOutcome {
    /// Decide the outcome from per-target results and the aggregate check.
    pub fn classify(targets: &[TargetReport], aggregate: Option<&AggregateCheck>) -> Self {
        if aggregate.is_some_and(|a| !a.passed) {
            RunOutcome::Failure
        } else if targets.iter().any(|t| t.status != TargetStatus::Healthy) {
            RunOutcome::PartialFailure
        } else {
            RunOutcome::Success
        }
    }

    /// Process exit status for automation pipelines.
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::Failure => 1,
            RunOutcome::PartialFailure => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::PartialFailure => "partial-failure",
            RunOutcome::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub environment: String,
    pub namespace: String,
    pub deployment_type: String,
    pub outcome: RunOutcome,
    pub backup: BackupOutcome,
    pub targets: Vec<TargetReport>,
    pub aggregate: Option<AggregateCheck>,
    pub started_at: u64,
    pub finished_at: u64,
}

impl RunReport {
    pub fn target(&self, name: &str) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.name == name)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn format_summary(&self) -> String {
        let mut out = String::new();

        out.push_str("\n╔══════════════════════════════════════════╗\n");
        out.push_str("║  rollgate deployment run                 ║\n");
        out.push_str("╠══════════════════════════════════════════╣\n");
        out.push_str(&format!("║  Env:      {:<30}║\n", self.environment));
        out.push_str(&format!("║  Type:     {:<30}║\n", self.deployment_type));
        out.push_str(&format!("║  Outcome:  {:<30}║\n", self.outcome.label()));
        out.push_str("╚══════════════════════════════════════════╝\n\n");

        out.push_str(&format!("Run:       {}\n", self.run_id));
        out.push_str(&format!("Namespace: {}\n", self.namespace));
        out.push_str(&format!("Backup:    {}\n", self.backup.summary()));
        out.push_str(&format!(
            "Duration:  {}s\n\n",
            self.finished_at.saturating_sub(self.started_at)
        ));

        out.push_str(&format!("Targets ({}):\n", self.targets.len()));
        for t in &self.targets {
            out.push_str(&format!("  {} {:<16} {}", t.status.icon(), t.name, t.status.label()));
            if let Some(reason) = t.reason.filter(|_| t.status != TargetStatus::Healthy) {
                out.push_str(&format!(": {reason}"));
            }
            out.push('\n');
            if let Some(score) = t.health_score {
                out.push_str(&format!("       Score:    {score}\n"));
            }
            if !t.errored_categories.is_empty() {
                let errored: Vec<String> =
                    t.errored_categories.iter().map(ToString::to_string).collect();
                out.push_str(&format!("       Errored:  {}\n", errored.join(", ")));
            }
            if let Some(detail) = &t.detail {
                out.push_str(&format!("       Detail:   {detail}\n"));
            }
            if let Some(note) = &t.note {
                out.push_str(&format!("       Note:     {note}\n"));
            }
            if t.reason == Some(FailureReason::RollbackFailed) {
                out.push_str("       Manual intervention required.\n");
            }
        }

        if let Some(aggregate) = &self.aggregate {
            out.push('\n');
            if aggregate.passed {
                out.push_str(&format!(
                    "Aggregate check: passed ({} targets)\n",
                    aggregate.reports.len()
                ));
            } else {
                out.push_str(&format!(
                    "Aggregate check: FAILED ({})\n",
                    aggregate.failed_targets.join(", ")
                ));
            }
        }

        out
    }
}
