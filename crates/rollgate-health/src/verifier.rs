//! Composite health verification.
//!
//! `HealthVerifier::verify` runs every probe of a target concurrently.
//! Each probe is bounded by the per-probe timeout and the whole call by
//! the aggregate timeout; probes still running at the aggregate deadline
//! are aborted and reported as `error`. The report is built fresh on
//! every call.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::{self, JoinSet};
use tracing::{debug, info, warn};

use rollgate_core::{
    CategoryOutcome, Deadline, DeploymentTarget, HealthCategory, HealthEndpoints, HealthReport,
};

use crate::probe::{ChannelProbe, HealthProbe, HttpProbe};

/// Timeouts applied to a verification call.
#[derive(Debug, Clone, Copy)]
pub struct VerifyConfig {
    pub probe_timeout: Duration,
    pub verify_timeout: Duration,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            verify_timeout: Duration::from_secs(30),
        }
    }
}

/// Runs a battery of probes and scores the result.
#[derive(Debug, Clone, Default)]
pub struct HealthVerifier {
    config: VerifyConfig,
}

impl HealthVerifier {
    pub fn new(config: VerifyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> VerifyConfig {
        self.config
    }

    /// Run `probes` against `target` and return a scored report.
    pub async fn verify(&self, target: &str, probes: &[Arc<dyn HealthProbe>]) -> HealthReport {
        let deadline = Deadline::after(self.config.verify_timeout);
        let probe_timeout = self.config.probe_timeout;

        let mut results: BTreeMap<HealthCategory, CategoryOutcome> = probes
            .iter()
            .map(|p| {
                (
                    p.category(),
                    CategoryOutcome::Error(format!(
                        "not finished within {:?}",
                        self.config.verify_timeout
                    )),
                )
            })
            .collect();

        let mut set = JoinSet::new();
        let mut categories: HashMap<task::Id, HealthCategory> = HashMap::new();
        for probe in probes {
            let probe = Arc::clone(probe);
            let category = probe.category();
            let handle = set.spawn(async move {
                let category = probe.category();
                let outcome = match tokio::time::timeout(probe_timeout, probe.check()).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        CategoryOutcome::Error(format!("probe timed out after {probe_timeout:?}"))
                    }
                };
                (category, outcome)
            });
            categories.insert(handle.id(), category);
        }

        loop {
            match tokio::time::timeout_at(deadline.instant(), set.join_next_with_id()).await {
                Ok(Some(Ok((_, (category, outcome))))) => {
                    debug!(%target, %category, ?outcome, "probe finished");
                    results.insert(category, outcome);
                }
                Ok(Some(Err(e))) => {
                    warn!(%target, error = %e, "probe task failed");
                    if let Some(category) = categories.get(&e.id()) {
                        results.insert(
                            *category,
                            CategoryOutcome::Error(format!("probe task failed: {e}")),
                        );
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        %target,
                        pending = set.len(),
                        timeout = ?self.config.verify_timeout,
                        "verification deadline reached, aborting remaining probes"
                    );
                    set.abort_all();
                    break;
                }
            }
        }

        let report = HealthReport::from_results(target, results);
        let errored = report.errored();
        info!(
            %target,
            score = report.score,
            categories = report.categories.len(),
            errored = errored.len(),
            "health verified"
        );
        report
    }
}

/// Produces a fresh health report for a target.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn verify(&self, target: &DeploymentTarget) -> HealthReport;
}

/// Verifier bound to the probes configured for each target.
pub struct ConfiguredHealthCheck {
    verifier: HealthVerifier,
    probes: HashMap<String, Vec<Arc<dyn HealthProbe>>>,
}

impl ConfiguredHealthCheck {
    pub fn new(verifier: HealthVerifier) -> Self {
        Self {
            verifier,
            probes: HashMap::new(),
        }
    }

    /// Register the probes for `target`, replacing any previous set.
    pub fn with_probes(mut self, target: &str, probes: Vec<Arc<dyn HealthProbe>>) -> Self {
        self.probes.insert(target.to_string(), probes);
        self
    }

    /// Register HTTP and channel probes from configured endpoints.
    pub fn with_endpoints(self, target: &str, endpoints: &HealthEndpoints) -> Self {
        self.with_probes(target, probes_for(endpoints))
    }
}

#[async_trait]
impl HealthCheck for ConfiguredHealthCheck {
    async fn verify(&self, target: &DeploymentTarget) -> HealthReport {
        match self.probes.get(&target.name) {
            Some(probes) => self.verifier.verify(&target.name, probes).await,
            None => {
                warn!(target = %target.name, "no health probes registered");
                HealthReport::from_results(&target.name, BTreeMap::new())
            }
        }
    }
}

/// Build the probe battery for a set of endpoints.
pub fn probes_for(endpoints: &HealthEndpoints) -> Vec<Arc<dyn HealthProbe>> {
    let mut probes: Vec<Arc<dyn HealthProbe>> = Vec::new();
    if let Some(url) = &endpoints.liveness {
        probes.push(Arc::new(HttpProbe::new(HealthCategory::Liveness, url)));
    }
    if let Some(url) = &endpoints.api {
        probes.push(Arc::new(HttpProbe::new(HealthCategory::Api, url)));
    }
    if let Some(url) = &endpoints.channel {
        probes.push(Arc::new(ChannelProbe::new(url)));
    }
    probes
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Probe that answers after a fixed delay.
    struct Scripted {
        category: HealthCategory,
        delay: Duration,
        outcome: CategoryOutcome,
    }

    #[async_trait]
    impl HealthProbe for Scripted {
        fn category(&self) -> HealthCategory {
            self.category
        }

        async fn check(&self) -> CategoryOutcome {
            tokio::time::sleep(self.delay).await;
            self.outcome.clone()
        }
    }

    fn scripted(category: HealthCategory, secs: u64, outcome: CategoryOutcome) -> Arc<dyn HealthProbe> {
        Arc::new(Scripted {
            category,
            delay: Duration::from_secs(secs),
            outcome,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn all_passing_scores_100() {
        let verifier = HealthVerifier::default();
        let report = verifier
            .verify(
                "backend",
                &[
                    scripted(HealthCategory::Liveness, 1, CategoryOutcome::Pass),
                    scripted(HealthCategory::Api, 2, CategoryOutcome::Pass),
                ],
            )
            .await;
        assert_eq!(report.score, 100);
        assert!(report.errored().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn probes_run_concurrently() {
        let verifier = HealthVerifier::default();
        let start = tokio::time::Instant::now();
        verifier
            .verify(
                "backend",
                &[
                    scripted(HealthCategory::Liveness, 4, CategoryOutcome::Pass),
                    scripted(HealthCategory::Api, 4, CategoryOutcome::Pass),
                    scripted(HealthCategory::Channel, 4, CategoryOutcome::Pass),
                ],
            )
            .await;
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_is_marked_error_by_probe_timeout() {
        let verifier = HealthVerifier::default();
        let report = verifier
            .verify(
                "backend",
                &[
                    scripted(HealthCategory::Liveness, 1, CategoryOutcome::Pass),
                    scripted(HealthCategory::Api, 60, CategoryOutcome::Pass),
                ],
            )
            .await;
        assert_eq!(report.score, 50);
        assert_eq!(report.errored(), vec![HealthCategory::Api]);
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_timeout_marks_unfinished_as_error() {
        let verifier = HealthVerifier::new(VerifyConfig {
            probe_timeout: Duration::from_secs(60),
            verify_timeout: Duration::from_secs(10),
        });
        let start = tokio::time::Instant::now();
        let report = verifier
            .verify(
                "backend",
                &[
                    scripted(HealthCategory::Liveness, 1, CategoryOutcome::Pass),
                    scripted(HealthCategory::Channel, 45, CategoryOutcome::Pass),
                ],
            )
            .await;
        assert!(start.elapsed() <= Duration::from_secs(11));
        assert_eq!(report.score, 50);
        assert!(report.categories[&HealthCategory::Channel].is_error());
    }

    #[tokio::test(start_paused = true)]
    async fn fail_and_error_are_distinguished() {
        let verifier = HealthVerifier::default();
        let report = verifier
            .verify(
                "backend",
                &[
                    scripted(HealthCategory::Liveness, 0, CategoryOutcome::Fail("503".into())),
                    scripted(HealthCategory::Api, 0, CategoryOutcome::Error("refused".into())),
                ],
            )
            .await;
        assert_eq!(report.score, 0);
        assert_eq!(report.errored(), vec![HealthCategory::Api]);
        assert!(!report.is_inconclusive());
    }

    struct Panicking;

    #[async_trait]
    impl HealthProbe for Panicking {
        fn category(&self) -> HealthCategory {
            HealthCategory::Channel
        }

        async fn check(&self) -> CategoryOutcome {
            panic!("decoder bug")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_check_is_reported_as_task_failure() {
        let verifier = HealthVerifier::default();
        let report = verifier
            .verify(
                "chain-node",
                &[
                    scripted(HealthCategory::Liveness, 1, CategoryOutcome::Pass),
                    Arc::new(Panicking),
                ],
            )
            .await;
        assert_eq!(report.score, 50);
        match &report.categories[&HealthCategory::Channel] {
            CategoryOutcome::Error(message) => {
                assert!(message.starts_with("probe task failed"), "{message}")
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregistered_target_scores_zero() {
        let check = ConfiguredHealthCheck::new(HealthVerifier::default());
        let target = DeploymentTarget::new("ghost", "prod", "img", 1);
        let report = check.verify(&target).await;
        assert_eq!(report.score, 0);
        assert!(report.categories.is_empty());
    }

    #[test]
    fn endpoints_map_to_categories() {
        let endpoints = HealthEndpoints {
            liveness: Some("http://backend/health".into()),
            api: None,
            channel: Some("ws://backend/ws".into()),
        };
        let categories: Vec<_> = probes_for(&endpoints).iter().map(|p| p.category()).collect();
        assert_eq!(categories, [HealthCategory::Liveness, HealthCategory::Channel]);
    }
}
