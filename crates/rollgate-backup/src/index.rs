//! BackupIndex: redb-backed catalogue of snapshots taken.
//!
//! Each `BackupRecord` is JSON-serialized into the `backups` table keyed
//! by its id. A record is rewritten once more when its remote copy lands.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;

use rollgate_core::BackupRecord;

use crate::error::{BackupError, BackupResult};

/// Backup records keyed by `{id}`.
const BACKUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("backups");

macro_rules! map_err {
    ($variant:ident) => {
        |e| BackupError::$variant(e.to_string())
    };
}

#[derive(Clone)]
pub struct BackupIndex {
    db: Arc<Database>,
}

impl BackupIndex {
    /// Open (or create) an index file, creating parent directories.
    pub fn open(path: &Path) -> BackupResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| BackupError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let db = Database::create(path).map_err(map_err!(Index))?;
        let index = Self { db: Arc::new(db) };
        index.ensure_tables()?;
        debug!(?path, "backup index opened");
        Ok(index)
    }

    pub fn open_in_memory() -> BackupResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Index))?;
        let index = Self { db: Arc::new(db) };
        index.ensure_tables()?;
        Ok(index)
    }

    fn ensure_tables(&self) -> BackupResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Index))?;
        txn.open_table(BACKUPS).map_err(map_err!(Index))?;
        txn.commit().map_err(map_err!(Index))?;
        Ok(())
    }

    pub fn put(&self, record: &BackupRecord) -> BackupResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Index))?;
        {
            let mut table = txn.open_table(BACKUPS).map_err(map_err!(Index))?;
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(map_err!(Index))?;
        }
        txn.commit().map_err(map_err!(Index))?;
        debug!(id = %record.id, "backup indexed");
        Ok(())
    }

    pub fn get(&self, id: &str) -> BackupResult<Option<BackupRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Index))?;
        let table = txn.open_table(BACKUPS).map_err(map_err!(Index))?;
        match table.get(id).map_err(map_err!(Index))? {
            Some(guard) => {
                let record = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// All records, newest first.
    pub fn list(&self) -> BackupResult<Vec<BackupRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Index))?;
        let table = txn.open_table(BACKUPS).map_err(map_err!(Index))?;
        let mut records = Vec::new();
        for entry in table.iter().map_err(map_err!(Index))? {
            let (_, value) = entry.map_err(map_err!(Index))?;
            let record: BackupRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            records.push(record);
        }
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    /// Records taken in `namespace`, newest first.
    pub fn list_for_namespace(&self, namespace: &str) -> BackupResult<Vec<BackupRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.namespace == namespace)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn record(id: &str, namespace: &str, timestamp: u64) -> BackupRecord {
        BackupRecord {
            id: id.to_string(),
            timestamp,
            namespace: namespace.to_string(),
            scope: BTreeSet::from(["deployments".to_string()]),
            storage_location: format!("/backups/{timestamp}-{id}"),
            remote_location: None,
        }
    }

    #[test]
    fn put_and_get() {
        let index = BackupIndex::open_in_memory().unwrap();
        index.put(&record("a1", "app-prod", 100)).unwrap();
        let fetched = index.get("a1").unwrap().unwrap();
        assert_eq!(fetched.namespace, "app-prod");
        assert!(index.get("missing").unwrap().is_none());
    }

    #[test]
    fn list_is_newest_first_and_filterable() {
        let index = BackupIndex::open_in_memory().unwrap();
        index.put(&record("a1", "app-prod", 100)).unwrap();
        index.put(&record("b2", "app-dev", 300)).unwrap();
        index.put(&record("c3", "app-prod", 200)).unwrap();

        let ids: Vec<_> = index.list().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, ["b2", "c3", "a1"]);

        let prod = index.list_for_namespace("app-prod").unwrap();
        assert_eq!(prod.len(), 2);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("index.redb");
        {
            let index = BackupIndex::open(&path).unwrap();
            index.put(&record("a1", "app-prod", 100)).unwrap();
        }
        let index = BackupIndex::open(&path).unwrap();
        assert_eq!(index.list().unwrap().len(), 1);
    }
}
