//! rollgate.toml configuration parser.
//!
//! The file names environments (namespace plus timing overrides), targets
//! (deployment coordinates, health endpoints, promotion threshold), and
//! deployment types (ordered subsets of targets). Resolving an environment
//! and a deployment type against operator-supplied images yields a
//! `DeploymentPlan`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::types::{DeploymentPlan, DeploymentTarget, FailurePolicy, PlanEntry, TargetPolicy};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollgateConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
    #[serde(default)]
    pub deployment_types: BTreeMap<String, DeploymentTypeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub poll_interval: String,
    pub rollout_timeout: String,
    pub settle_delay: String,
    pub rollback_timeout: String,
    pub probe_timeout: String,
    pub verify_timeout: String,
    pub max_verify_attempts: u32,
    pub backup_enabled: bool,
    pub backup_dir: PathBuf,
    pub backup_scope: Vec<String>,
    /// Second directory snapshots are copied to (e.g. a mounted bucket).
    pub backup_remote_dir: Option<PathBuf>,
    pub backup_upload_timeout: String,
    pub rollback_enabled: bool,
    pub failure_policy: FailurePolicy,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            poll_interval: "10s".to_string(),
            rollout_timeout: "600s".to_string(),
            settle_delay: "30s".to_string(),
            rollback_timeout: "300s".to_string(),
            probe_timeout: "5s".to_string(),
            verify_timeout: "30s".to_string(),
            max_verify_attempts: 3,
            backup_enabled: true,
            backup_dir: PathBuf::from("backups"),
            backup_scope: vec![
                "deployments".to_string(),
                "services".to_string(),
                "configmaps".to_string(),
            ],
            backup_remote_dir: None,
            backup_upload_timeout: "120s".to_string(),
            rollback_enabled: true,
            failure_policy: FailurePolicy::AbortOnFirstFailure,
        }
    }
}

/// Per-environment settings. Unset fields fall back to `[defaults]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub namespace: String,
    pub kube_context: Option<String>,
    pub poll_interval: Option<String>,
    pub rollout_timeout: Option<String>,
    pub settle_delay: Option<String>,
    pub rollback_timeout: Option<String>,
    pub probe_timeout: Option<String>,
    pub verify_timeout: Option<String>,
    pub backup_enabled: Option<bool>,
    pub rollback_enabled: Option<bool>,
    pub failure_policy: Option<FailurePolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Deployment object name, defaults to the target name.
    pub deployment: Option<String>,
    /// Container to update, defaults to the target name.
    pub container: Option<String>,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    pub health_threshold: u8,
    pub rollback_enabled: Option<bool>,
    #[serde(default)]
    pub health: HealthEndpoints,
}

fn default_replicas() -> u32 {
    1
}

/// Probe URLs for a target. A missing URL means that category does not apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthEndpoints {
    pub liveness: Option<String>,
    pub api: Option<String>,
    pub channel: Option<String>,
}

impl HealthEndpoints {
    pub fn is_empty(&self) -> bool {
        self.liveness.is_none() && self.api.is_none() && self.channel.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentTypeConfig {
    /// Targets in dependency order.
    pub targets: Vec<String>,
}

/// Resolved timing knobs for one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timings {
    pub poll_interval: Duration,
    pub rollout_timeout: Duration,
    pub settle_delay: Duration,
    pub rollback_timeout: Duration,
    pub probe_timeout: Duration,
    pub verify_timeout: Duration,
    pub max_verify_attempts: u32,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            rollout_timeout: Duration::from_secs(600),
            settle_delay: Duration::from_secs(30),
            rollback_timeout: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(5),
            verify_timeout: Duration::from_secs(30),
            max_verify_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSettings {
    pub enabled: bool,
    pub dir: PathBuf,
    pub scope: BTreeSet<String>,
    pub remote_dir: Option<PathBuf>,
    pub upload_timeout: Duration,
}

/// An environment with every default applied.
#[derive(Debug, Clone)]
pub struct EnvironmentSettings {
    pub name: String,
    pub namespace: String,
    pub kube_context: Option<String>,
    pub timings: Timings,
    pub backup: BackupSettings,
    pub rollback_enabled: bool,
    pub failure_policy: FailurePolicy,
}

impl RollgateConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse and validate a config document.
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let config: RollgateConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross references and value ranges.
    pub fn validate(&self) -> ConfigResult<()> {
        for (name, target) in &self.targets {
            if target.health_threshold > 100 {
                return Err(crate::error::PlanError::InvalidThreshold {
                    target: name.clone(),
                    threshold: target.health_threshold,
                }
                .into());
            }
            if target.health.is_empty() {
                return Err(ConfigError::NoHealthEndpoints(name.clone()));
            }
        }
        for kind in self.deployment_types.values() {
            for target in &kind.targets {
                if !self.targets.contains_key(target) {
                    return Err(ConfigError::UnknownTarget(target.clone()));
                }
            }
        }
        for name in self.environments.keys() {
            self.environment(name)?;
        }
        Ok(())
    }

    /// Resolve an environment against `[defaults]`.
    pub fn environment(&self, name: &str) -> ConfigResult<EnvironmentSettings> {
        let env = self
            .environments
            .get(name)
            .ok_or_else(|| ConfigError::UnknownEnvironment(name.to_string()))?;
        let d = &self.defaults;

        let pick = |field: &str, over: &Option<String>, default: &str| {
            parse_duration(field, over.as_deref().unwrap_or(default))
        };

        let timings = Timings {
            poll_interval: pick("poll_interval", &env.poll_interval, &d.poll_interval)?,
            rollout_timeout: pick("rollout_timeout", &env.rollout_timeout, &d.rollout_timeout)?,
            settle_delay: pick("settle_delay", &env.settle_delay, &d.settle_delay)?,
            rollback_timeout: pick("rollback_timeout", &env.rollback_timeout, &d.rollback_timeout)?,
            probe_timeout: pick("probe_timeout", &env.probe_timeout, &d.probe_timeout)?,
            verify_timeout: pick("verify_timeout", &env.verify_timeout, &d.verify_timeout)?,
            max_verify_attempts: d.max_verify_attempts.max(1),
        };

        Ok(EnvironmentSettings {
            name: name.to_string(),
            namespace: env.namespace.clone(),
            kube_context: env.kube_context.clone(),
            timings,
            backup: BackupSettings {
                enabled: env.backup_enabled.unwrap_or(d.backup_enabled),
                dir: d.backup_dir.clone(),
                scope: d.backup_scope.iter().cloned().collect(),
                remote_dir: d.backup_remote_dir.clone(),
                upload_timeout: parse_duration("backup_upload_timeout", &d.backup_upload_timeout)?,
            },
            rollback_enabled: env.rollback_enabled.unwrap_or(d.rollback_enabled),
            failure_policy: env.failure_policy.unwrap_or(d.failure_policy),
        })
    }

    /// Ordered target names for a deployment type.
    pub fn deployment_type(&self, name: &str) -> ConfigResult<&[String]> {
        self.deployment_types
            .get(name)
            .map(|t| t.targets.as_slice())
            .ok_or_else(|| ConfigError::UnknownDeploymentType(name.to_string()))
    }

    pub fn target(&self, name: &str) -> ConfigResult<&TargetConfig> {
        self.targets
            .get(name)
            .ok_or_else(|| ConfigError::UnknownTarget(name.to_string()))
    }

    /// Build the plan for one run.
    ///
    /// Every target of the deployment type needs an image, and every image
    /// must belong to a target of the deployment type.
    pub fn build_plan(
        &self,
        env: &EnvironmentSettings,
        deployment_type: &str,
        images: &BTreeMap<String, String>,
    ) -> ConfigResult<DeploymentPlan> {
        let names = self.deployment_type(deployment_type)?;

        if let Some(stray) = images.keys().find(|k| !names.contains(k)) {
            return Err(ConfigError::UnexpectedImage(stray.clone()));
        }

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let cfg = self.target(name)?;
            let image = images
                .get(name)
                .ok_or_else(|| ConfigError::MissingImage(name.clone()))?;
            let target = DeploymentTarget {
                name: name.clone(),
                namespace: env.namespace.clone(),
                deployment: cfg.deployment.clone().unwrap_or_else(|| name.clone()),
                container: cfg.container.clone().unwrap_or_else(|| name.clone()),
                desired_image: image.clone(),
                current_revision: None,
                replica_count: cfg.replicas,
            };
            entries.push(PlanEntry {
                target,
                policy: TargetPolicy {
                    health_threshold: cfg.health_threshold,
                    rollback_enabled: cfg.rollback_enabled.unwrap_or(env.rollback_enabled),
                },
            });
        }

        Ok(DeploymentPlan::new(entries, env.failure_policy)?)
    }

    /// A starting config for a chain-node / backend / frontend stack.
    pub fn scaffold() -> Self {
        let mut environments = BTreeMap::new();
        for (name, rollout_timeout) in [("dev", "300s"), ("staging", "600s"), ("production", "900s")] {
            environments.insert(
                name.to_string(),
                EnvironmentConfig {
                    namespace: format!("app-{name}"),
                    kube_context: None,
                    poll_interval: None,
                    rollout_timeout: Some(rollout_timeout.to_string()),
                    settle_delay: None,
                    rollback_timeout: None,
                    probe_timeout: None,
                    verify_timeout: None,
                    backup_enabled: Some(name != "dev"),
                    rollback_enabled: None,
                    failure_policy: None,
                },
            );
        }

        let mut targets = BTreeMap::new();
        targets.insert(
            "chain-node".to_string(),
            TargetConfig {
                deployment: None,
                container: None,
                replicas: 1,
                health_threshold: 100,
                rollback_enabled: None,
                health: HealthEndpoints {
                    liveness: Some("http://chain-node:9933/health".to_string()),
                    api: None,
                    channel: Some("ws://chain-node:9944".to_string()),
                },
            },
        );
        targets.insert(
            "backend".to_string(),
            TargetConfig {
                deployment: None,
                container: None,
                replicas: 3,
                health_threshold: 80,
                rollback_enabled: None,
                health: HealthEndpoints {
                    liveness: Some("http://backend:8080/health".to_string()),
                    api: Some("http://backend:8080/api/status".to_string()),
                    channel: None,
                },
            },
        );
        targets.insert(
            "frontend".to_string(),
            TargetConfig {
                deployment: None,
                container: None,
                replicas: 2,
                health_threshold: 50,
                rollback_enabled: None,
                health: HealthEndpoints {
                    liveness: Some("http://frontend:80/".to_string()),
                    api: None,
                    channel: None,
                },
            },
        );

        let mut deployment_types = BTreeMap::new();
        let types: [(&str, &[&str]); 4] = [
            ("full", &["chain-node", "backend", "frontend"]),
            ("chain", &["chain-node"]),
            ("backend", &["backend"]),
            ("frontend", &["frontend"]),
        ];
        for (name, members) in types {
            deployment_types.insert(
                name.to_string(),
                DeploymentTypeConfig {
                    targets: members.iter().map(|s| s.to_string()).collect(),
                },
            );
        }

        Self {
            defaults: DefaultsConfig::default(),
            environments,
            targets,
            deployment_types,
        }
    }
}

/// Parse a duration string like "5s", "500ms", "2m", "1h", or bare seconds.
pub fn parse_duration(field: &str, value: &str) -> ConfigResult<Duration> {
    let s = value.trim();
    let parsed = if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    };
    parsed.ok_or_else(|| ConfigError::InvalidDuration {
        field: field.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[defaults]
backup_dir = "/tmp/rollgate"

[environments.staging]
namespace = "app-staging"
rollout_timeout = "2m"
settle_delay = "5s"

[targets.backend]
replicas = 3
health_threshold = 80
health = { liveness = "http://backend/health" }

[targets.frontend]
container = "web"
health_threshold = 50
rollback_enabled = false
health = { liveness = "http://frontend/" }

[deployment_types.full]
targets = ["backend", "frontend"]
"#;

    fn images(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("f", "5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("f", "500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("f", "2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("f", "1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("f", "10").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        let err = parse_duration("settle_delay", "soon").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration { ref field, .. } if field == "settle_delay"));
    }

    #[test]
    fn environment_merges_defaults() {
        let config = RollgateConfig::parse(SAMPLE).unwrap();
        let env = config.environment("staging").unwrap();
        assert_eq!(env.namespace, "app-staging");
        assert_eq!(env.timings.rollout_timeout, Duration::from_secs(120));
        assert_eq!(env.timings.settle_delay, Duration::from_secs(5));
        assert_eq!(env.timings.poll_interval, Duration::from_secs(10));
        assert_eq!(env.timings.rollback_timeout, Duration::from_secs(300));
        assert!(env.backup.enabled);
        assert_eq!(env.backup.dir, PathBuf::from("/tmp/rollgate"));
        assert_eq!(env.failure_policy, FailurePolicy::AbortOnFirstFailure);
    }

    #[test]
    fn unknown_environment_is_an_error() {
        let config = RollgateConfig::parse(SAMPLE).unwrap();
        assert!(matches!(
            config.environment("qa"),
            Err(ConfigError::UnknownEnvironment(_))
        ));
    }

    #[test]
    fn build_plan_orders_and_applies_policy() {
        let config = RollgateConfig::parse(SAMPLE).unwrap();
        let env = config.environment("staging").unwrap();
        let plan = config
            .build_plan(
                &env,
                "full",
                &images(&[("backend", "reg/backend:v2"), ("frontend", "reg/web:v9")]),
            )
            .unwrap();

        let entries = plan.entries();
        assert_eq!(entries[0].target.name, "backend");
        assert_eq!(entries[0].target.replica_count, 3);
        assert!(entries[0].policy.rollback_enabled);
        assert_eq!(entries[1].target.container, "web");
        assert_eq!(entries[1].target.deployment, "frontend");
        assert_eq!(entries[1].target.namespace, "app-staging");
        assert!(!entries[1].policy.rollback_enabled);
    }

    #[test]
    fn build_plan_requires_every_image() {
        let config = RollgateConfig::parse(SAMPLE).unwrap();
        let env = config.environment("staging").unwrap();
        let err = config
            .build_plan(&env, "full", &images(&[("backend", "reg/backend:v2")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingImage(ref t) if t == "frontend"));
    }

    #[test]
    fn build_plan_rejects_stray_images() {
        let config = RollgateConfig::parse(SAMPLE).unwrap();
        let env = config.environment("staging").unwrap();
        let err = config
            .build_plan(
                &env,
                "full",
                &images(&[
                    ("backend", "a"),
                    ("frontend", "b"),
                    ("worker", "c"),
                ]),
            )
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnexpectedImage(ref t) if t == "worker"));
    }

    #[test]
    fn validate_catches_unknown_type_members() {
        let doc = r#"
[deployment_types.full]
targets = ["ghost"]
"#;
        assert!(matches!(
            RollgateConfig::parse(doc),
            Err(ConfigError::UnknownTarget(_))
        ));
    }

    #[test]
    fn validate_requires_health_endpoints() {
        let doc = r#"
[targets.backend]
health_threshold = 80
"#;
        assert!(matches!(
            RollgateConfig::parse(doc),
            Err(ConfigError::NoHealthEndpoints(_))
        ));
    }

    #[test]
    fn scaffold_round_trips_through_toml() {
        let rendered = RollgateConfig::scaffold().to_toml_string().unwrap();
        let parsed = RollgateConfig::parse(&rendered).unwrap();
        assert_eq!(
            parsed.deployment_type("full").unwrap(),
            ["chain-node", "backend", "frontend"]
        );
        assert!(!parsed.environment("dev").unwrap().backup.enabled);
    }
}
