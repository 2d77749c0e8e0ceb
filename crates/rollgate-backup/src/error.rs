//! Error types for the backup manager.

use std::path::PathBuf;

use rollgate_cluster::ClusterError;
use thiserror::Error;

/// Result type alias for backup operations.
pub type BackupResult<T> = Result<T, BackupError>;

/// Errors that can occur while taking or indexing a snapshot.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("failed to export {kind}: {source}")]
    Export {
        kind: String,
        #[source]
        source: ClusterError,
    },

    #[error("export of {kind} timed out")]
    ExportTimeout { kind: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("backup index error: {0}")]
    Index(String),

    #[error("upload failed: {0}")]
    Upload(String),
}
