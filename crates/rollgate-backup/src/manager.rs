//! Pre-deployment snapshots.
//!
//! A snapshot exports every resource kind in scope from the control
//! plane and writes it under `<dir>/<timestamp>-<id>/`:
//!
//! ```text
//! backups/
//!   1760000000-3f2a.../
//!     deployments.json
//!     services.json
//!     configmaps.json
//!     manifest.json      <- the BackupRecord
//!   index.redb           <- BackupIndex
//! ```
//!
//! The local write is the safety net and its failure is an error; a
//! snapshot that fails part way removes its directory. The remote copy is
//! secondary. It runs in the background so the rollout does not wait on
//! it, is bounded by a timeout, and on success fills `remote_location` in
//! the index and the local manifest. `finish_uploads` waits for copies
//! still in flight.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use rollgate_cluster::ClusterClient;
use rollgate_core::{epoch_secs, BackupRecord};

use crate::error::{BackupError, BackupResult};
use crate::index::BackupIndex;

/// Anything that can take a pre-deployment snapshot.
#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn snapshot(&self, namespace: &str, scope: &BTreeSet<String>)
    -> BackupResult<BackupRecord>;
}

/// Secondary copy of a finished local snapshot.
#[async_trait]
pub trait RemoteUploader: Send + Sync {
    /// Upload the snapshot directory and return its remote location.
    async fn upload(&self, record: &BackupRecord, local: &Path) -> BackupResult<String>;
}

/// Copies snapshots into a second directory, such as a mounted bucket.
#[derive(Debug, Clone)]
pub struct DirectoryUploader {
    root: PathBuf,
}

impl DirectoryUploader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl RemoteUploader for DirectoryUploader {
    async fn upload(&self, _record: &BackupRecord, local: &Path) -> BackupResult<String> {
        let name = local
            .file_name()
            .ok_or_else(|| BackupError::Upload(format!("{} has no file name", local.display())))?;
        let dest = self.root.join(name);
        tokio::fs::create_dir_all(&dest).await.map_err(|source| BackupError::Io {
            path: dest.clone(),
            source,
        })?;

        let mut entries = tokio::fs::read_dir(local).await.map_err(|source| BackupError::Io {
            path: local.to_path_buf(),
            source,
        })?;
        while let Some(entry) = entries.next_entry().await.map_err(|source| BackupError::Io {
            path: local.to_path_buf(),
            source,
        })? {
            let to = dest.join(entry.file_name());
            tokio::fs::copy(entry.path(), &to)
                .await
                .map_err(|source| BackupError::Io { path: to, source })?;
        }
        Ok(dest.display().to_string())
    }
}

/// Snapshots namespace state through the cluster adapter.
pub struct BackupManager {
    cluster: Arc<dyn ClusterClient>,
    dir: PathBuf,
    index: Option<BackupIndex>,
    uploader: Option<Arc<dyn RemoteUploader>>,
    export_timeout: Duration,
    upload_timeout: Duration,
    uploads: Mutex<JoinSet<()>>,
}

impl BackupManager {
    pub fn new(cluster: Arc<dyn ClusterClient>, dir: impl Into<PathBuf>) -> Self {
        Self {
            cluster,
            dir: dir.into(),
            index: None,
            uploader: None,
            export_timeout: Duration::from_secs(60),
            upload_timeout: Duration::from_secs(120),
            uploads: Mutex::new(JoinSet::new()),
        }
    }

    pub fn with_index(mut self, index: BackupIndex) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn RemoteUploader>, timeout: Duration) -> Self {
        self.uploader = Some(uploader);
        self.upload_timeout = timeout;
        self
    }

    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    async fn write_json(path: &Path, value: &impl serde::Serialize) -> BackupResult<()> {
        let bytes =
            serde_json::to_vec_pretty(value).map_err(|e| BackupError::Serialize(e.to_string()))?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|source| BackupError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Wait for background uploads started by earlier snapshots.
    pub async fn finish_uploads(&self) {
        let mut uploads = std::mem::take(
            &mut *self.uploads.lock().unwrap_or_else(PoisonError::into_inner),
        );
        while let Some(joined) = uploads.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "backup upload task failed");
            }
        }
    }

    async fn write_snapshot(
        &self,
        namespace: &str,
        scope: &BTreeSet<String>,
        record: &BackupRecord,
        location: &Path,
    ) -> BackupResult<()> {
        for kind in scope {
            let exported =
                tokio::time::timeout(self.export_timeout, self.cluster.export_resources(namespace, kind))
                    .await
                    .map_err(|_| BackupError::ExportTimeout { kind: kind.clone() })?
                    .map_err(|source| BackupError::Export {
                        kind: kind.clone(),
                        source,
                    })?;
            Self::write_json(&location.join(format!("{kind}.json")), &exported).await?;
        }
        Self::write_json(&location.join("manifest.json"), record).await
    }

    fn spawn_upload(&self, record: &BackupRecord, location: PathBuf) {
        let Some(uploader) = self.uploader.clone() else {
            return;
        };
        let index = self.index.clone();
        let timeout = self.upload_timeout;
        let mut record = record.clone();

        self.uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spawn(async move {
                let remote = match tokio::time::timeout(timeout, uploader.upload(&record, &location)).await {
                    Ok(Ok(remote)) => remote,
                    Ok(Err(e)) => {
                        warn!(id = %record.id, error = %e, "backup upload failed, keeping local copy only");
                        return;
                    }
                    Err(_) => {
                        warn!(id = %record.id, ?timeout, "backup upload timed out, keeping local copy only");
                        return;
                    }
                };
                info!(id = %record.id, location = %remote, "backup uploaded");
                record.remote_location = Some(remote);

                if let Err(e) = Self::write_json(&location.join("manifest.json"), &record).await {
                    warn!(id = %record.id, error = %e, "could not record remote copy in manifest");
                }
                if let Some(index) = index {
                    if let Err(e) = index.put(&record) {
                        warn!(id = %record.id, error = %e, "could not record remote copy in index");
                    }
                }
            });
    }
}

#[async_trait]
impl BackupStore for BackupManager {
    async fn snapshot(
        &self,
        namespace: &str,
        scope: &BTreeSet<String>,
    ) -> BackupResult<BackupRecord> {
        let id = Uuid::new_v4().to_string();
        let timestamp = epoch_secs();
        let location = self.dir.join(format!("{timestamp}-{id}"));

        tokio::fs::create_dir_all(&location)
            .await
            .map_err(|source| BackupError::Io {
                path: location.clone(),
                source,
            })?;

        let record = BackupRecord {
            id,
            timestamp,
            namespace: namespace.to_string(),
            scope: scope.clone(),
            storage_location: location.display().to_string(),
            remote_location: None,
        };

        if let Err(e) = self.write_snapshot(namespace, scope, &record, &location).await {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&location).await {
                warn!(
                    location = %location.display(),
                    error = %cleanup,
                    "could not remove partial backup"
                );
            }
            return Err(e);
        }
        if let Some(index) = &self.index {
            index.put(&record)?;
        }
        self.spawn_upload(&record, location);

        info!(
            id = %record.id,
            %namespace,
            kinds = record.scope.len(),
            location = %record.storage_location,
            "backup written"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollgate_cluster::{ClusterError, ClusterOp, ClusterResult, ClusterStatus, InMemoryCluster};
    use rollgate_core::{DeploymentTarget, Revision};

    fn scope(kinds: &[&str]) -> BTreeSet<String> {
        kinds.iter().map(|k| k.to_string()).collect()
    }

    fn cluster() -> Arc<InMemoryCluster> {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_deployment("app-prod", "backend", "reg/backend:v1", 2);
        cluster
    }

    struct FailingUploader;

    #[async_trait]
    impl RemoteUploader for FailingUploader {
        async fn upload(&self, _record: &BackupRecord, _local: &Path) -> BackupResult<String> {
            Err(BackupError::Upload("bucket unavailable".into()))
        }
    }

    struct HangingUploader;

    #[async_trait]
    impl RemoteUploader for HangingUploader {
        async fn upload(&self, _record: &BackupRecord, _local: &Path) -> BackupResult<String> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn snapshot_writes_each_kind_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let index = BackupIndex::open_in_memory().unwrap();
        let manager = BackupManager::new(cluster(), dir.path()).with_index(index.clone());

        let record = manager
            .snapshot("app-prod", &scope(&["deployments", "services"]))
            .await
            .unwrap();

        let location = PathBuf::from(&record.storage_location);
        assert!(location.join("deployments.json").exists());
        assert!(location.join("services.json").exists());

        let manifest: BackupRecord = serde_json::from_slice(
            &std::fs::read(location.join("manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest, record);

        let deployments: serde_json::Value = serde_json::from_slice(
            &std::fs::read(location.join("deployments.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(deployments["items"][0]["image"], "reg/backend:v1");

        assert_eq!(index.get(&record.id).unwrap(), Some(record));
    }

    #[tokio::test]
    async fn export_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster();
        cluster.inject(
            ClusterOp::Export,
            ClusterError::Connectivity("connection refused".into()),
        );
        let manager = BackupManager::new(cluster, dir.path());
        let err = manager
            .snapshot("app-prod", &scope(&["deployments"]))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Export { .. }));
    }

    /// Delegates to an in-memory cluster but fails the export of one kind.
    struct FailsOnKind {
        inner: Arc<InMemoryCluster>,
        kind: &'static str,
    }

    #[async_trait]
    impl ClusterClient for FailsOnKind {
        async fn check_namespace(&self, namespace: &str) -> ClusterResult<()> {
            self.inner.check_namespace(namespace).await
        }

        async fn apply_image(&self, target: &DeploymentTarget, image: &str) -> ClusterResult<()> {
            self.inner.apply_image(target, image).await
        }

        async fn get_status(&self, target: &DeploymentTarget) -> ClusterResult<ClusterStatus> {
            self.inner.get_status(target).await
        }

        async fn get_revision_history(&self, target: &DeploymentTarget) -> ClusterResult<Vec<Revision>> {
            self.inner.get_revision_history(target).await
        }

        async fn rollback_to(&self, target: &DeploymentTarget, revision: u64) -> ClusterResult<()> {
            self.inner.rollback_to(target, revision).await
        }

        async fn export_resources(
            &self,
            namespace: &str,
            kind: &str,
        ) -> ClusterResult<serde_json::Value> {
            if kind == self.kind {
                return Err(ClusterError::Connectivity("connection reset".into()));
            }
            self.inner.export_resources(namespace, kind).await
        }
    }

    #[tokio::test]
    async fn failed_snapshot_leaves_no_partial_directory() {
        let dir = tempfile::tempdir().unwrap();
        let index = BackupIndex::open_in_memory().unwrap();
        let cluster = Arc::new(FailsOnKind {
            inner: cluster(),
            kind: "services",
        });
        let manager = BackupManager::new(cluster, dir.path()).with_index(index.clone());

        let err = manager
            .snapshot("app-prod", &scope(&["configmaps", "deployments", "services"]))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Export { ref kind, .. } if kind == "services"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(index.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn upload_failure_keeps_local_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let index = BackupIndex::open_in_memory().unwrap();
        let manager = BackupManager::new(cluster(), dir.path())
            .with_index(index.clone())
            .with_uploader(Arc::new(FailingUploader), Duration::from_secs(5));
        let record = manager
            .snapshot("app-prod", &scope(&["deployments"]))
            .await
            .unwrap();
        manager.finish_uploads().await;

        assert!(PathBuf::from(&record.storage_location).join("manifest.json").exists());
        assert_eq!(index.get(&record.id).unwrap().unwrap().remote_location, None);
    }

    #[tokio::test]
    async fn snapshot_does_not_wait_for_upload() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(cluster(), dir.path())
            .with_uploader(Arc::new(HangingUploader), Duration::from_secs(3600));

        let record = tokio::time::timeout(
            Duration::from_secs(10),
            manager.snapshot("app-prod", &scope(&["deployments"])),
        )
        .await
        .expect("snapshot blocked on the upload")
        .unwrap();
        assert!(record.remote_location.is_none());
        assert!(PathBuf::from(&record.storage_location).join("manifest.json").exists());
    }

    #[tokio::test]
    async fn hanging_upload_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(cluster(), dir.path())
            .with_uploader(Arc::new(HangingUploader), Duration::from_millis(50));
        manager
            .snapshot("app-prod", &scope(&["deployments"]))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), manager.finish_uploads())
            .await
            .expect("upload outlived its timeout");
    }

    #[tokio::test]
    async fn directory_uploader_copies_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let index = BackupIndex::open_in_memory().unwrap();
        let manager = BackupManager::new(cluster(), dir.path())
            .with_index(index.clone())
            .with_uploader(
                Arc::new(DirectoryUploader::new(remote.path())),
                Duration::from_secs(5),
            );
        let record = manager
            .snapshot("app-prod", &scope(&["deployments"]))
            .await
            .unwrap();
        manager.finish_uploads().await;

        let indexed = index.get(&record.id).unwrap().unwrap();
        let remote_dir = PathBuf::from(indexed.remote_location.clone().unwrap());
        assert!(remote_dir.starts_with(remote.path()));
        assert!(remote_dir.join("deployments.json").exists());

        let manifest: BackupRecord = serde_json::from_slice(
            &std::fs::read(PathBuf::from(&record.storage_location).join("manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest, indexed);
    }
}
