pub mod backups;
pub mod deploy;
pub mod init;
pub mod plan;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context};
use clap::Args;

use rollgate_core::{DeploymentPlan, EnvironmentSettings, FailurePolicy, PlanEntry, RollgateConfig};

/// Which environment, deployment type, and images a run covers.
#[derive(Args, Debug, Clone)]
pub struct Selection {
    /// Environment from rollgate.toml.
    #[arg(long)]
    pub env: String,

    /// Deployment type from rollgate.toml.
    #[arg(long = "type")]
    pub deployment_type: String,

    /// Image per target, repeatable.
    #[arg(long = "image", value_name = "TARGET=IMAGE", required = true)]
    pub images: Vec<String>,
}

/// Command-line overrides of the resolved plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct Overrides {
    pub best_effort: bool,
    pub no_rollback: bool,
}

pub fn load_config(path: &Path) -> anyhow::Result<RollgateConfig> {
    RollgateConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

/// Split `target=image` arguments.
pub fn parse_images(args: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    let mut images = BTreeMap::new();
    for arg in args {
        let Some((target, image)) = arg.split_once('=') else {
            bail!("--image expects TARGET=IMAGE, got {arg:?}");
        };
        let (target, image) = (target.trim(), image.trim());
        if target.is_empty() || image.is_empty() {
            bail!("--image expects TARGET=IMAGE, got {arg:?}");
        }
        if images.insert(target.to_string(), image.to_string()).is_some() {
            bail!("image given twice for target {target}");
        }
    }
    Ok(images)
}

/// Resolve the environment and plan for a selection, applying overrides.
pub fn resolve(
    config: &RollgateConfig,
    selection: &Selection,
    overrides: Overrides,
) -> anyhow::Result<(EnvironmentSettings, DeploymentPlan)> {
    let mut env = config.environment(&selection.env)?;
    if overrides.best_effort {
        env.failure_policy = FailurePolicy::BestEffort;
    }
    let images = parse_images(&selection.images)?;
    let plan = config.build_plan(&env, &selection.deployment_type, &images)?;

    if !overrides.no_rollback {
        return Ok((env, plan));
    }
    env.rollback_enabled = false;
    let policy = plan.failure_policy;
    let entries: Vec<PlanEntry> = plan
        .into_entries()
        .into_iter()
        .map(|mut entry| {
            entry.policy.rollback_enabled = false;
            entry
        })
        .collect();
    Ok((env, DeploymentPlan::new(entries, policy)?))
}
