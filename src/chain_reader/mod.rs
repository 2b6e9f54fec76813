//! Source-chain queries used by the watcher

use async_trait::async_trait;

use crate::error::{ChainReadError, DecodeError};
use crate::types::BridgeEvent;

pub mod evm;

pub use evm::{parse_rpc_urls, EvmChainReader};

/// Read-only view of the source chain.
///
/// Implementations never mutate watcher state; every call is a pure query.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Latest block height known to the endpoint
    async fn current_height(&self) -> Result<u64, ChainReadError>;

    /// Logs matching `event_signature` in the inclusive range `[from, to]`.
    ///
    /// A log that matched but could not be decoded is returned as an `Err`
    /// entry so the caller can skip it without losing the rest of the batch.
    async fn get_events(
        &self,
        from: u64,
        to: u64,
        event_signature: &str,
    ) -> Result<Vec<Result<BridgeEvent, DecodeError>>, ChainReadError>;
}
