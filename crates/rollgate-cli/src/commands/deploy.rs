use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};

use rollgate_backup::{BackupIndex, BackupManager, BackupStore, DirectoryUploader};
use rollgate_cluster::{ClusterClient, KubectlClient, RetryPolicy, RetryingClient};
use rollgate_core::{BackupSettings, DeploymentPlan, RollgateConfig, Timings};
use rollgate_health::{ConfiguredHealthCheck, HealthVerifier, VerifyConfig};
use rollgate_rollout::{RolloutSettings, RunRequest, Sequencer, SequencerError};

use super::{load_config, resolve, Overrides, Selection};
use crate::OutputFormat;

pub struct DeployOptions {
    pub format: OutputFormat,
    pub force_backup: bool,
    pub no_backup: bool,
    pub overrides: Overrides,
}

/// Run a deployment and return the process exit status.
pub async fn deploy(
    config_path: &Path,
    selection: &Selection,
    options: DeployOptions,
) -> anyhow::Result<u8> {
    let config = load_config(config_path)?;
    let (mut env, plan) = resolve(&config, selection, options.overrides)?;
    if options.no_backup {
        env.backup.enabled = false;
    }

    let cluster: Arc<dyn ClusterClient> = Arc::new(RetryingClient::new(
        KubectlClient::new().with_context(env.kube_context.clone()),
        RetryPolicy::default(),
    ));

    let health = health_check(&config, &plan, &env.timings)?;
    let mut sequencer = Sequencer::new(
        Arc::clone(&cluster),
        Arc::new(health),
        RolloutSettings::from(&env.timings),
    );
    let backups = if env.backup.enabled {
        let manager = Arc::new(backup_manager(cluster, &env.backup)?);
        sequencer = sequencer.with_backup(Arc::clone(&manager) as Arc<dyn BackupStore>);
        Some(manager)
    } else {
        None
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            let _ = cancel_tx.send(true);
        }
    });

    let request = RunRequest {
        environment: env.name.clone(),
        namespace: env.namespace.clone(),
        deployment_type: selection.deployment_type.clone(),
        plan,
        backup_scope: env.backup.scope.clone(),
        force_backup: options.force_backup,
    };

    let result = sequencer.run(request, cancel_rx).await;
    if let Some(manager) = &backups {
        manager.finish_uploads().await;
    }

    match result {
        Ok(report) => {
            match options.format {
                OutputFormat::Json => println!("{}", report.to_json()?),
                OutputFormat::Text => println!("{}", report.format_summary()),
            }
            let code = report.outcome.exit_code();
            info!(outcome = report.outcome.label(), code, "exiting");
            Ok(u8::try_from(code).unwrap_or(1))
        }
        Err(e) => hard_failure(&env.name, &selection.deployment_type, e, options.format),
    }
}

fn health_check(
    config: &RollgateConfig,
    plan: &DeploymentPlan,
    timings: &Timings,
) -> anyhow::Result<ConfiguredHealthCheck> {
    let verifier = HealthVerifier::new(VerifyConfig {
        probe_timeout: timings.probe_timeout,
        verify_timeout: timings.verify_timeout,
    });
    let mut health = ConfiguredHealthCheck::new(verifier);
    for entry in plan.entries() {
        let target = config.target(&entry.target.name)?;
        health = health.with_endpoints(&entry.target.name, &target.health);
    }
    Ok(health)
}

fn backup_manager(
    cluster: Arc<dyn ClusterClient>,
    settings: &BackupSettings,
) -> anyhow::Result<BackupManager> {
    let index_path = settings.dir.join("index.redb");
    let index = BackupIndex::open(&index_path)
        .with_context(|| format!("opening backup index {}", index_path.display()))?;
    let mut manager = BackupManager::new(cluster, &settings.dir).with_index(index);
    if let Some(remote) = &settings.remote_dir {
        manager = manager.with_uploader(
            Arc::new(DirectoryUploader::new(remote)),
            settings.upload_timeout,
        );
    }
    Ok(manager)
}

/// Report a run that stopped before touching any target.
fn hard_failure(
    environment: &str,
    deployment_type: &str,
    error: SequencerError,
    format: OutputFormat,
) -> anyhow::Result<u8> {
    let error = anyhow::Error::from(error);
    error!(%environment, %deployment_type, error = %format!("{error:#}"), "deployment run aborted");
    match format {
        OutputFormat::Json => {
            let body = serde_json::json!({
                "environment": environment,
                "deployment_type": deployment_type,
                "outcome": "hard-failure",
                "error": format!("{error:#}"),
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(1)
        }
        OutputFormat::Text => Err(error),
    }
}
