//! Typed errors crossing component boundaries

use alloy::primitives::B256;
use thiserror::Error;

/// Failures reported by a [`ChainReader`](crate::chain_reader::ChainReader)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainReadError {
    /// Endpoint unreachable, timed out, or returned malformed data
    #[error("connection error: {0}")]
    Connection(String),
    /// Endpoint refused the requested block span; caller must shrink it
    #[error("range [{from}, {to}] too large: {reason}")]
    RangeTooLarge { from: u64, to: u64, reason: String },
}

/// A single log that matched the filter but could not be decoded.
///
/// Carries whatever identifying context the raw log had so the skip is
/// auditable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("undecodable log (tx={tx_hash:?}, log_index={log_index:?}, block={block_number:?}): {reason}")]
pub struct DecodeError {
    pub tx_hash: Option<B256>,
    pub log_index: Option<u64>,
    pub block_number: Option<u64>,
    pub reason: String,
}

impl DecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            tx_hash: None,
            log_index: None,
            block_number: None,
            reason: reason.into(),
        }
    }
}

/// Checkpoint persistence and cursor-ordering failures
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("checkpoint database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("checkpoint migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("checkpoint data corrupt: {0}")]
    Corrupt(String),
    #[error("cursor regression: current {current}, requested {requested}")]
    Regression { current: u64, requested: u64 },
}
