//! PostgreSQL checkpoint store
//!
//! Applies each change as a single row operation instead of rewriting the
//! whole cursor. Rows are scoped by watcher id so several watchers can share
//! one database.

use alloy::primitives::B256;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{error, info};

use super::{CheckpointStore, ScanCursor};
use crate::error::CheckpointError;
use crate::types::EventKey;

/// Checkpoint rows in the `scan_checkpoints` / `processed_events` tables
#[derive(Debug, Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
    watcher_id: String,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool, watcher_id: impl Into<String>) -> Self {
        Self {
            pool,
            watcher_id: watcher_id.into(),
        }
    }

    /// Connect and run pending migrations
    pub async fn connect(database_url: &str, watcher_id: &str) -> Result<Self, CheckpointError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(watcher_id, "Checkpoint database ready");
        Ok(Self::new(pool, watcher_id))
    }

    fn to_db_int(value: u64, what: &str) -> Result<i64, CheckpointError> {
        i64::try_from(value)
            .map_err(|_| CheckpointError::Corrupt(format!("{} {} exceeds BIGINT", what, value)))
    }

    fn from_db_int(value: i64, what: &str) -> Result<u64, CheckpointError> {
        u64::try_from(value)
            .map_err(|_| CheckpointError::Corrupt(format!("negative {} {}", what, value)))
    }

    async fn upsert_height(&self, height: u64) -> Result<(), CheckpointError> {
        // GREATEST keeps the stored height monotonic even across racing writers
        sqlx::query(
            r#"
            INSERT INTO scan_checkpoints (watcher_id, last_scanned_height, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (watcher_id) DO UPDATE
            SET last_scanned_height = GREATEST(scan_checkpoints.last_scanned_height, EXCLUDED.last_scanned_height),
                updated_at = NOW()
            "#,
        )
        .bind(&self.watcher_id)
        .bind(Self::to_db_int(height, "height")?)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(error = ?e, "SQL error committing scan height");
            e
        })?;
        Ok(())
    }
}

/// Height to resume from. Keys without a height row (crash before the first
/// commit) resume just below the lowest recorded key, never from genesis.
fn resume_height(stored: Option<u64>, lowest_key_block: Option<u64>) -> Option<u64> {
    match (stored, lowest_key_block) {
        (Some(height), _) => Some(height),
        (None, Some(block)) => Some(block.saturating_sub(1)),
        (None, None) => None,
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self) -> Result<Option<ScanCursor>, CheckpointError> {
        let row = sqlx::query(
            "SELECT last_scanned_height FROM scan_checkpoints WHERE watcher_id = $1",
        )
        .bind(&self.watcher_id)
        .fetch_optional(&self.pool)
        .await?;

        let rows = sqlx::query(
            "SELECT tx_hash, log_index, block_number FROM processed_events WHERE watcher_id = $1",
        )
        .bind(&self.watcher_id)
        .fetch_all(&self.pool)
        .await?;

        let stored = row
            .map(|row| Self::from_db_int(row.get("last_scanned_height"), "height"))
            .transpose()?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: Vec<u8> = row.get("tx_hash");
            if raw.len() != 32 {
                return Err(CheckpointError::Corrupt(format!(
                    "tx_hash of {} bytes",
                    raw.len()
                )));
            }
            let key = EventKey::new(
                B256::from_slice(&raw),
                Self::from_db_int(row.get("log_index"), "log_index")?,
            );
            entries.push((key, Self::from_db_int(row.get("block_number"), "block_number")?));
        }

        let lowest = entries.iter().map(|(_, block)| *block).min();
        let Some(height) = resume_height(stored, lowest) else {
            return Ok(None);
        };

        let mut cursor = ScanCursor::new(height);
        for (key, block_number) in entries {
            cursor.insert(key, block_number);
        }
        Ok(Some(cursor))
    }

    async fn record_processed(
        &self,
        _cursor: &ScanCursor,
        key: &EventKey,
        block_number: u64,
    ) -> Result<(), CheckpointError> {
        sqlx::query(
            r#"
            INSERT INTO processed_events (watcher_id, tx_hash, log_index, block_number)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (watcher_id, tx_hash, log_index) DO NOTHING
            "#,
        )
        .bind(&self.watcher_id)
        .bind(key.tx_hash.as_slice())
        .bind(Self::to_db_int(key.log_index, "log_index")?)
        .bind(Self::to_db_int(block_number, "block_number")?)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(error = ?e, key = %key, "SQL error recording processed event");
            e
        })?;
        Ok(())
    }

    async fn record_commit(&self, cursor: &ScanCursor) -> Result<(), CheckpointError> {
        self.upsert_height(cursor.last_scanned_height).await
    }

    async fn record_eviction(
        &self,
        _cursor: &ScanCursor,
        cutoff: u64,
    ) -> Result<(), CheckpointError> {
        sqlx::query("DELETE FROM processed_events WHERE watcher_id = $1 AND block_number < $2")
            .bind(&self.watcher_id)
            .bind(Self::to_db_int(cutoff, "cutoff")?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        format!("postgres:{}", self.watcher_id)
    }
}
