use std::path::Path;

use rollgate_core::{DeploymentPlan, EnvironmentSettings, FailurePolicy};

use super::{load_config, resolve, Overrides, Selection};
use crate::OutputFormat;

pub fn plan(config_path: &Path, selection: &Selection, format: OutputFormat) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let (env, plan) = resolve(&config, selection, Overrides::default())?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
        OutputFormat::Text => println!("{}", format_plan(&env, &selection.deployment_type, &plan)),
    }
    Ok(())
}

fn format_plan(env: &EnvironmentSettings, deployment_type: &str, plan: &DeploymentPlan) -> String {
    let mut out = String::new();
    let policy = match plan.failure_policy {
        FailurePolicy::AbortOnFirstFailure => "abort-on-first-failure",
        FailurePolicy::BestEffort => "best-effort",
    };

    out.push_str(&format!("Environment: {} ({})\n", env.name, env.namespace));
    if let Some(context) = &env.kube_context {
        out.push_str(&format!("Context:     {context}\n"));
    }
    out.push_str(&format!("Type:        {deployment_type}\n"));
    out.push_str(&format!("Policy:      {policy}\n"));
    out.push_str(&format!(
        "Backup:      {}\n\n",
        if env.backup.enabled {
            format!("{} -> {}", scope(env), env.backup.dir.display())
        } else {
            "disabled".to_string()
        }
    ));

    for (i, entry) in plan.entries().iter().enumerate() {
        let t = &entry.target;
        out.push_str(&format!("  {}. {:<16} {}\n", i + 1, t.name, t.desired_image));
        out.push_str(&format!(
            "       deployment {}/{} container {} replicas {}\n",
            t.namespace, t.deployment, t.container, t.replica_count
        ));
        out.push_str(&format!(
            "       threshold {} rollback {}\n",
            entry.policy.health_threshold,
            if entry.policy.rollback_enabled { "on" } else { "off" }
        ));
    }
    out
}

fn scope(env: &EnvironmentSettings) -> String {
    env.backup.scope.iter().cloned().collect::<Vec<_>>().join(",")
}
