//! In-process checkpoint store for local runs and tests

use std::sync::Mutex;

use async_trait::async_trait;

use super::{CheckpointStore, ScanCursor};
use crate::error::CheckpointError;
use crate::types::EventKey;

/// Keeps the last written snapshot in memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    snapshot: Mutex<Option<ScanCursor>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store as if a previous run had persisted `cursor`
    pub fn with_cursor(cursor: ScanCursor) -> Self {
        Self {
            snapshot: Mutex::new(Some(cursor)),
        }
    }

    /// Last persisted snapshot
    pub fn snapshot(&self) -> Option<ScanCursor> {
        self.snapshot.lock().ok().and_then(|guard| guard.clone())
    }

    fn store(&self, cursor: &ScanCursor) -> Result<(), CheckpointError> {
        let mut guard = self
            .snapshot
            .lock()
            .map_err(|_| CheckpointError::Corrupt("memory store lock poisoned".to_string()))?;
        *guard = Some(cursor.clone());
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Option<ScanCursor>, CheckpointError> {
        Ok(self.snapshot())
    }

    async fn record_processed(
        &self,
        cursor: &ScanCursor,
        _key: &EventKey,
        _block_number: u64,
    ) -> Result<(), CheckpointError> {
        self.store(cursor)
    }

    async fn record_commit(&self, cursor: &ScanCursor) -> Result<(), CheckpointError> {
        self.store(cursor)
    }

    async fn record_eviction(
        &self,
        cursor: &ScanCursor,
        _cutoff: u64,
    ) -> Result<(), CheckpointError> {
        self.store(cursor)
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
