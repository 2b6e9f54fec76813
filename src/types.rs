//! Shared event and outcome types flowing through the watcher pipeline

use std::fmt;

use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

/// Canonical dedup key for an observed event.
///
/// A transaction may emit several lock events, so the transaction hash alone
/// is not unique; the log index disambiguates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub tx_hash: B256,
    pub log_index: u64,
}

impl EventKey {
    pub fn new(tx_hash: B256, log_index: u64) -> Self {
        Self { tx_hash, log_index }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.log_index)
    }
}

/// One `TokensLocked` event observed on the source chain.
///
/// Payload fields are carried verbatim; the pipeline never interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeEvent {
    pub source_tx_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
    /// Locked token on the source chain
    pub asset_id: Address,
    pub sender: Address,
    /// Destination-side recipient, opaque bytes as emitted
    pub recipient: Bytes,
    pub amount: U256,
    pub destination_chain_id: U256,
}

impl BridgeEvent {
    pub fn key(&self) -> EventKey {
        EventKey::new(self.source_tx_hash, self.log_index)
    }

    /// Sort key for draining a scanned range in chain order
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

/// Result of asking the external validator about an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Event is legitimate; the only outcome that permits dispatch
    Approved,
    /// Event was examined and refused
    Rejected(String),
    /// No trustworthy answer (timeout, transport failure, bad response)
    Indeterminate(String),
}

/// Destination-side proof that an action was submitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReceipt {
    /// Destination transaction identifier
    pub tx_id: String,
    /// True when no real transaction was broadcast
    pub simulated: bool,
}

/// Result of dispatching the destination action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Submitted(ActionReceipt),
    Failed { cause: String, retryable: bool },
}

/// Inclusive block range handled by one scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRange {
    pub from: u64,
    pub to: u64,
}

impl ScanRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    /// Number of blocks in the range
    pub fn span(&self) -> u64 {
        self.to.saturating_sub(self.from) + 1
    }

    /// Keep the start, shrink the range to at most `span` blocks
    pub fn truncate(&self, span: u64) -> Self {
        let span = span.max(1);
        Self {
            from: self.from,
            to: self.to.min(self.from.saturating_add(span - 1)),
        }
    }
}

impl fmt::Display for ScanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}
