//! rollgate-cluster: the orchestrator's view of a cluster control plane.
//!
//! The orchestrator needs four capabilities from a control plane: set an
//! image, read replica availability, read revision history, and revert to
//! a revision. Backups additionally export raw resources. This crate
//! defines that contract and three implementations:
//!
//! ```text
//! ClusterClient (trait)
//!   ├── KubectlClient     shells out to kubectl, parses -o json
//!   ├── InMemoryCluster   scripted control plane for tests
//!   └── RetryingClient<C> bounded exponential backoff around any client
//! ```
//!
//! Errors are classified so callers can tell transient failures
//! (`Connectivity`, optionally `Conflict`) from fatal ones (`NotFound`,
//! `Rejected`).

pub mod client;
pub mod kubectl;
pub mod memory;
pub mod retry;

pub use client::{ClusterClient, ClusterError, ClusterResult, ClusterStatus};
pub use kubectl::KubectlClient;
pub use memory::{ClusterOp, InMemoryCluster};
pub use retry::{RetryPolicy, RetryingClient};
