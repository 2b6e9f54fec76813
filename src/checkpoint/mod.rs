//! Scan cursor and dedup window with pluggable durable storage
//!
//! The [`Checkpoint`] is owned by the watcher and is the single mutation point
//! for progress. Every mutation is written through to a [`CheckpointStore`]
//! before it is acknowledged, so a restart resumes at the last committed
//! height with every already-processed key still known.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::CheckpointError;
use crate::types::EventKey;

pub mod file;
pub mod memory;
pub mod postgres;

pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;
pub use postgres::PgCheckpointStore;

/// Durable progress marker: last fully scanned height plus the keys processed
/// within the trailing window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanCursor {
    pub last_scanned_height: u64,
    /// Key -> originating block number
    processed: HashMap<EventKey, u64>,
}

impl ScanCursor {
    pub fn new(last_scanned_height: u64) -> Self {
        Self {
            last_scanned_height,
            processed: HashMap::new(),
        }
    }

    pub fn contains(&self, key: &EventKey) -> bool {
        self.processed.contains_key(key)
    }

    /// Returns false if the key was already present
    pub fn insert(&mut self, key: EventKey, block_number: u64) -> bool {
        if self.processed.contains_key(&key) {
            return false;
        }
        self.processed.insert(key, block_number);
        true
    }

    /// Drop every key whose block is strictly below `cutoff`
    pub fn evict_below(&mut self, cutoff: u64) -> usize {
        let before = self.processed.len();
        self.processed.retain(|_, block| *block >= cutoff);
        before - self.processed.len()
    }

    pub fn processed_len(&self) -> usize {
        self.processed.len()
    }

    /// Processed entries sorted by (block, key) for stable snapshots
    pub fn processed_entries(&self) -> Vec<(EventKey, u64)> {
        let mut entries: Vec<_> = self.processed.iter().map(|(k, b)| (*k, *b)).collect();
        entries.sort_by_key(|(key, block)| (*block, *key));
        entries
    }
}

/// Storage backend for the checkpoint.
///
/// Each hook receives the cursor state *after* the in-memory change, plus the
/// delta, so snapshot stores can rewrite everything and row stores can apply
/// just the change.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load persisted state; `None` when nothing was ever written
    async fn load(&self) -> Result<Option<ScanCursor>, CheckpointError>;

    async fn record_processed(
        &self,
        cursor: &ScanCursor,
        key: &EventKey,
        block_number: u64,
    ) -> Result<(), CheckpointError>;

    async fn record_commit(&self, cursor: &ScanCursor) -> Result<(), CheckpointError>;

    async fn record_eviction(&self, cursor: &ScanCursor, cutoff: u64)
        -> Result<(), CheckpointError>;

    /// Whether state survives a process restart
    fn is_durable(&self) -> bool;

    /// Human-readable location for logs
    fn describe(&self) -> String;
}

/// The watcher's owned cursor plus dedup window
pub struct Checkpoint {
    cursor: ScanCursor,
    window_size: u64,
    /// Fresh cursor with no configured start: anchored at the chain head on
    /// the first successful poll
    needs_anchor: bool,
    store: Arc<dyn CheckpointStore>,
}

impl Checkpoint {
    /// Open a checkpoint, preferring persisted state over `start_block`.
    ///
    /// `start_block` is the first block to scan on a fresh cursor. When it is
    /// `None` and nothing is persisted, the cursor waits to be anchored at the
    /// current chain head.
    pub async fn open(
        store: Arc<dyn CheckpointStore>,
        window_size: u64,
        start_block: Option<u64>,
    ) -> Result<Self, CheckpointError> {
        if !store.is_durable() {
            warn!(
                store = %store.describe(),
                "Checkpoint store is not durable; progress and dedup state are lost on restart"
            );
        }

        let (cursor, needs_anchor) = match store.load().await? {
            Some(cursor) => {
                info!(
                    store = %store.describe(),
                    last_scanned_height = cursor.last_scanned_height,
                    processed_keys = cursor.processed_len(),
                    "Resuming from persisted checkpoint"
                );
                if let Some(start) = start_block {
                    if start > cursor.last_scanned_height + 1 {
                        warn!(
                            start_block = start,
                            last_scanned_height = cursor.last_scanned_height,
                            "START_BLOCK ignored in favour of persisted checkpoint"
                        );
                    }
                }
                (cursor, false)
            }
            None => match start_block {
                Some(start) => {
                    info!(start_block = start, "No persisted checkpoint, starting at configured block");
                    let cursor = ScanCursor::new(start.saturating_sub(1));
                    // Persist the seed so a crash before the first commit
                    // cannot resume below it
                    store.record_commit(&cursor).await?;
                    (cursor, false)
                }
                None => {
                    info!("No persisted checkpoint and no start block, will start at chain head");
                    (ScanCursor::new(0), true)
                }
            },
        };

        Ok(Self {
            cursor,
            window_size,
            needs_anchor,
            store,
        })
    }

    pub fn last_scanned_height(&self) -> u64 {
        self.cursor.last_scanned_height
    }

    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    pub fn processed_len(&self) -> usize {
        self.cursor.processed_len()
    }

    pub fn cursor(&self) -> &ScanCursor {
        &self.cursor
    }

    pub fn needs_anchor(&self) -> bool {
        self.needs_anchor
    }

    pub fn is_processed(&self, key: &EventKey) -> bool {
        self.cursor.contains(key)
    }

    /// Idempotent; returns whether the key was newly recorded.
    ///
    /// The key stays recorded in memory even if persisting it fails, so the
    /// running process never acts on it twice.
    pub async fn mark_processed(
        &mut self,
        key: EventKey,
        block_number: u64,
    ) -> Result<bool, CheckpointError> {
        if !self.cursor.insert(key, block_number) {
            return Ok(false);
        }
        self.store
            .record_processed(&self.cursor, &key, block_number)
            .await?;
        debug!(key = %key, block_number, "Event marked processed");
        Ok(true)
    }

    /// Advance the cursor. Committing the current height is a no-op; a lower
    /// height is rejected.
    pub async fn commit(&mut self, height: u64) -> Result<(), CheckpointError> {
        let current = self.cursor.last_scanned_height;
        if height < current {
            return Err(CheckpointError::Regression {
                current,
                requested: height,
            });
        }
        if height == current && !self.needs_anchor {
            return Ok(());
        }
        self.cursor.last_scanned_height = height;
        self.store.record_commit(&self.cursor).await?;
        self.needs_anchor = false;
        debug!(height, "Checkpoint committed");
        Ok(())
    }

    /// Anchor a fresh cursor just below `first_block`
    pub async fn anchor(&mut self, first_block: u64) -> Result<(), CheckpointError> {
        let height = first_block.saturating_sub(1);
        info!(first_block, "Anchoring fresh checkpoint at chain head");
        self.commit(height.max(self.cursor.last_scanned_height)).await
    }

    /// Drop keys whose block is older than `height - window_size`
    pub async fn evict_older_than(&mut self, height: u64) -> Result<usize, CheckpointError> {
        let cutoff = height.saturating_sub(self.window_size);
        if cutoff == 0 {
            return Ok(0);
        }
        let evicted = self.cursor.evict_below(cutoff);
        if evicted > 0 {
            self.store.record_eviction(&self.cursor, cutoff).await?;
            debug!(cutoff, evicted, "Evicted processed keys outside dedup window");
        }
        Ok(evicted)
    }
}
