//! rollgate-backup: the safety net taken before a run mutates anything.
//!
//! `BackupManager` exports each resource kind in scope through the
//! cluster adapter, writes it to a timestamped directory, optionally
//! copies it to a remote location, and records a `BackupRecord` in the
//! redb-backed `BackupIndex`.

pub mod error;
pub mod index;
pub mod manager;

pub use error::{BackupError, BackupResult};
pub use index::BackupIndex;
pub use manager::{BackupManager, BackupStore, DirectoryUploader, RemoteUploader};
