//! rollgate-health: composite health verification for deployed targets.
//!
//! A target's health is a battery of category probes run concurrently:
//!
//! ```text
//! HealthVerifier::verify(target, probes)
//!   ├── HttpProbe(Liveness)   GET liveness endpoint
//!   ├── HttpProbe(Api)        GET dependent API-layer endpoint
//!   └── ChannelProbe          WebSocket ping/pong
//!        → HealthReport { score = passed * 100 / checked }
//! ```
//!
//! Each category ends `pass`, `fail`, or `error`. `error` means the probe
//! could not run (connection refused, timed out) and counts as a failure
//! for scoring while being listed separately for diagnostics.
//!
//! The `HealthCheck` trait is what rollout controllers consume;
//! `ConfiguredHealthCheck` binds per-target probe sets built from
//! `rollgate.toml` endpoints.

pub mod probe;
pub mod verifier;

pub use probe::{ChannelProbe, HealthProbe, HttpProbe, ProbeError};
pub use verifier::{probes_for, ConfiguredHealthCheck, HealthCheck, HealthVerifier, VerifyConfig};
