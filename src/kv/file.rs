//! JSON-file backing store
//!
//! Holds every record in memory and rewrites a single `records.json`
//! snapshot in the storage directory after each mutation. The snapshot is
//! written to a temporary file and renamed into place so a crash never
//! leaves a half-written table behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs as tokio_fs;
use tokio::sync::RwLock;

use super::memory::Tables;
use super::{KvError, KvStore, Record};

const SNAPSHOT_FILE: &str = "records.json";

#[derive(Serialize, Deserialize)]
struct Snapshot {
    records: Vec<Record>,
}

/// A backing store persisted as a JSON snapshot on disk
pub struct FileKv {
    storage_path: PathBuf,
    tables: RwLock<Tables>,
}

impl FileKv {
    /// Open the store in `storage_path`, loading an existing snapshot if
    /// there is one.
    pub async fn open(storage_path: impl AsRef<Path>) -> Result<Self, KvError> {
        let storage_path = storage_path.as_ref().to_path_buf();

        if !storage_path.exists() {
            tokio_fs::create_dir_all(&storage_path).await?;
        }

        let snapshot_path = storage_path.join(SNAPSHOT_FILE);
        let tables = if snapshot_path.exists() {
            let data = tokio_fs::read(&snapshot_path).await?;
            let snapshot: Snapshot = serde_json::from_slice(&data)
                .map_err(|e| KvError::SerializationError(e.to_string()))?;
            log::debug!(
                "loaded {} records from {}",
                snapshot.records.len(),
                snapshot_path.display()
            );
            Tables::from_records(snapshot.records)
        } else {
            Tables::default()
        };

        Ok(Self {
            storage_path,
            tables: RwLock::new(tables),
        })
    }

    /// Directory holding the snapshot
    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    async fn persist(&self, tables: &Tables) -> Result<(), KvError> {
        let snapshot = Snapshot {
            records: tables.records(),
        };
        let json = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| KvError::SerializationError(e.to_string()))?;

        let tmp_path = self.storage_path.join(format!("{}.tmp", SNAPSHOT_FILE));
        tokio_fs::write(&tmp_path, json).await?;
        tokio_fs::rename(&tmp_path, self.storage_path.join(SNAPSHOT_FILE)).await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileKv {
    async fn put(&self, record: Record) -> Result<(), KvError> {
        let mut tables = self.tables.write().await;
        let mut next = tables.clone();
        next.insert(record);

        // Memory only changes once the snapshot is on disk, so a cancelled
        // call leaves both sides at the old state.
        self.persist(&next).await?;
        *tables = next;
        Ok(())
    }

    async fn get(&self, primary: &str, secondary: &str) -> Result<Option<Record>, KvError> {
        Ok(self.tables.read().await.get(primary, secondary))
    }

    async fn query_primary_prefix(
        &self,
        primary: &str,
        secondary_prefix: &str,
    ) -> Result<Vec<Record>, KvError> {
        Ok(self
            .tables
            .read()
            .await
            .primary_prefix(primary, secondary_prefix))
    }

    async fn query_inverse_prefix(
        &self,
        secondary: &str,
        primary_prefix: &str,
    ) -> Result<Vec<Record>, KvError> {
        Ok(self
            .tables
            .read()
            .await
            .inverse_prefix(secondary, primary_prefix))
    }

    async fn delete(&self, primary: &str, secondary: &str) -> Result<bool, KvError> {
        let mut tables = self.tables.write().await;
        if tables.get(primary, secondary).is_none() {
            return Ok(false);
        }

        let mut next = tables.clone();
        next.remove(primary, secondary);
        self.persist(&next).await?;
        *tables = next;
        Ok(true)
    }
}
