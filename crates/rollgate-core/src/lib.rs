pub mod config;
pub mod deadline;
pub mod error;
pub mod types;

pub use config::{
    parse_duration, BackupSettings, EnvironmentSettings, HealthEndpoints, RollgateConfig, Timings,
};
pub use deadline::Deadline;
pub use error::{ConfigError, ConfigResult, PlanError, TransitionError};
pub use types::*;
