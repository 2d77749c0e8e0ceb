//! rollgate-rollout: zero-downtime rollouts with health-gated promotion.
//!
//! ```text
//! Sequencer
//!   ├── ClusterClient::check_namespace      prerequisites
//!   ├── BackupStore::snapshot               once per run
//!   └── for each target, in order
//!         RolloutLocks::try_acquire
//!         RolloutController                 Pending → Updating → AwaitingHealth
//!           ├── HealthCheck::verify         after the settle delay
//!           └── RollbackController          on a failed gate
//!   aggregate HealthCheck pass → RunReport
//! ```
//!
//! Every loop is bounded by a `Deadline` and watches a cancellation
//! signal, so no attempt is left non-terminal.

pub mod controller;
pub mod lock;
mod poll;
pub mod report;
pub mod rollback;
pub mod sequencer;
pub mod settings;

pub use controller::{RolloutController, ALREADY_AT_DESIRED_IMAGE};
pub use lock::{RolloutGuard, RolloutLocks};
pub use report::{AggregateCheck, BackupOutcome, RunOutcome, RunReport, TargetReport, TargetStatus};
pub use rollback::RollbackController;
pub use sequencer::{RunRequest, Sequencer, SequencerError};
pub use settings::RolloutSettings;
