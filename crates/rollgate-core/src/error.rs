//! Error types for plan construction, configuration, and state transitions.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::RolloutStatus;

/// A `RolloutAttempt` was asked to take an edge its state machine does not have.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid rollout transition {from} -> {to}")]
pub struct TransitionError {
    pub from: RolloutStatus,
    pub to: RolloutStatus,
}

/// Errors building a `DeploymentPlan`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("deployment plan has no targets")]
    Empty,

    #[error("target listed more than once in plan: {0}")]
    DuplicateTarget(String),

    #[error("health threshold for {target} must be 0-100, got {threshold}")]
    InvalidThreshold { target: String, threshold: u8 },
}

/// Errors loading or resolving `rollgate.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: String, value: String },

    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),

    #[error("unknown deployment type: {0}")]
    UnknownDeploymentType(String),

    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("no image given for target {0}")]
    MissingImage(String),

    #[error("image given for {0}, which is not part of this deployment type")]
    UnexpectedImage(String),

    #[error("target {0} has no health endpoints configured")]
    NoHealthEndpoints(String),

    #[error(transparent)]
    Plan(#[from] PlanError),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
