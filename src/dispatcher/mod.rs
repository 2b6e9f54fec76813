//! Destination-side actions for validated events

use async_trait::async_trait;

use crate::types::{ActionOutcome, BridgeEvent};

pub mod evm;
pub mod simulated;

pub use evm::EvmMintDispatcher;
pub use simulated::SimulatedDispatcher;

/// Submits the mint/release for an approved event.
///
/// Implementations should be idempotent per [`EventKey`](crate::types::EventKey)
/// where the destination allows it, since a retryable failure or timeout
/// leads to the same event being dispatched again.
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(&self, event: &BridgeEvent) -> ActionOutcome;
}
