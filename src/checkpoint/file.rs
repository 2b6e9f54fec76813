//! JSON snapshot checkpoint store
//!
//! The whole cursor is rewritten on every change: serialized to a sibling
//! temp file, flushed, then renamed over the target so a crash mid-write
//! leaves the previous snapshot intact.

use std::path::{Path, PathBuf};

use alloy::primitives::B256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{CheckpointStore, ScanCursor};
use crate::error::CheckpointError;
use crate::types::EventKey;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    last_scanned_height: u64,
    processed: Vec<ProcessedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProcessedEntry {
    tx_hash: B256,
    log_index: u64,
    block_number: u64,
}

impl From<&ScanCursor> for Snapshot {
    fn from(cursor: &ScanCursor) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            last_scanned_height: cursor.last_scanned_height,
            processed: cursor
                .processed_entries()
                .into_iter()
                .map(|(key, block_number)| ProcessedEntry {
                    tx_hash: key.tx_hash,
                    log_index: key.log_index,
                    block_number,
                })
                .collect(),
        }
    }
}

impl TryFrom<Snapshot> for ScanCursor {
    type Error = CheckpointError;

    fn try_from(snapshot: Snapshot) -> Result<Self, Self::Error> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(CheckpointError::Corrupt(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        let mut cursor = ScanCursor::new(snapshot.last_scanned_height);
        for entry in snapshot.processed {
            cursor.insert(EventKey::new(entry.tx_hash, entry.log_index), entry.block_number);
        }
        Ok(cursor)
    }
}

/// Checkpoint persisted as a single JSON file
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    /// Serializes writers so renames never interleave
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "checkpoint".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn write_snapshot(&self, cursor: &ScanCursor) -> Result<(), CheckpointError> {
        let _guard = self.write_lock.lock().await;

        let body = serde_json::to_vec_pretty(&Snapshot::from(cursor))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.temp_path();
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<ScanCursor>, CheckpointError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_slice(&raw)?;
        ScanCursor::try_from(snapshot).map(Some)
    }

    async fn record_processed(
        &self,
        cursor: &ScanCursor,
        _key: &EventKey,
        _block_number: u64,
    ) -> Result<(), CheckpointError> {
        self.write_snapshot(cursor).await
    }

    async fn record_commit(&self, cursor: &ScanCursor) -> Result<(), CheckpointError> {
        self.write_snapshot(cursor).await
    }

    async fn record_eviction(
        &self,
        cursor: &ScanCursor,
        _cutoff: u64,
    ) -> Result<(), CheckpointError> {
        self.write_snapshot(cursor).await
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}
