//! EVM JSON-RPC chain reader
//!
//! Queries `eth_blockNumber` / `eth_getLogs` through one or more alloy HTTP
//! providers. Providers are tried in order; only connection-class failures
//! fall through to the next URL.

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, Log};
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use tracing::{debug, warn};

use super::ChainReader;
use crate::error::{ChainReadError, DecodeError};
use crate::types::BridgeEvent;

/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Reader over a bridge contract's lock events
pub struct EvmChainReader {
    providers: Vec<(String, RootProvider<Http<Client>>)>,
    bridge_address: Address,
}

impl EvmChainReader {
    /// Build a reader with one provider per URL; the first URL is primary
    pub fn new(urls: &[String], bridge_address: Address) -> Result<Self> {
        if urls.is_empty() {
            return Err(eyre::eyre!("At least one RPC URL is required"));
        }
        let providers = urls
            .iter()
            .map(|url| {
                let parsed = url
                    .parse()
                    .wrap_err_with(|| format!("Invalid RPC URL: {}", url))?;
                Ok((url.clone(), ProviderBuilder::new().on_http(parsed)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            providers,
            bridge_address,
        })
    }

    pub fn bridge_address(&self) -> Address {
        self.bridge_address
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }
}

#[async_trait]
impl ChainReader for EvmChainReader {
    async fn current_height(&self) -> Result<u64, ChainReadError> {
        let mut last_err = None;
        for (url, provider) in &self.providers {
            match provider.get_block_number().await {
                Ok(height) => return Ok(height),
                Err(e) => {
                    warn!(rpc = %url, error = %e, "eth_blockNumber failed, trying next endpoint");
                    last_err = Some(e.to_string());
                }
            }
        }
        Err(ChainReadError::Connection(
            last_err.unwrap_or_else(|| "no RPC endpoints configured".to_string()),
        ))
    }

    async fn get_events(
        &self,
        from: u64,
        to: u64,
        event_signature: &str,
    ) -> Result<Vec<Result<BridgeEvent, DecodeError>>, ChainReadError> {
        let topic0 = keccak256(event_signature.as_bytes());
        let filter = Filter::new()
            .address(self.bridge_address)
            .event_signature(topic0)
            .from_block(from)
            .to_block(to);

        let mut last_err = None;
        for (url, provider) in &self.providers {
            match provider.get_logs(&filter).await {
                Ok(logs) => {
                    debug!(rpc = %url, from, to, count = logs.len(), "Fetched logs");
                    return Ok(logs
                        .iter()
                        .filter(|log| !log.removed)
                        .map(|log| decode_lock_log(log, topic0))
                        .collect());
                }
                Err(e) => match classify_rpc_error(&e.to_string(), from, to) {
                    // Every endpoint enforces its own limit; shrinking is the
                    // caller's job
                    err @ ChainReadError::RangeTooLarge { .. } => return Err(err),
                    ChainReadError::Connection(msg) => {
                        warn!(rpc = %url, from, to, error = %msg, "eth_getLogs failed, trying next endpoint");
                        last_err = Some(msg);
                    }
                },
            }
        }
        Err(ChainReadError::Connection(
            last_err.unwrap_or_else(|| "no RPC endpoints configured".to_string()),
        ))
    }
}

/// Map a provider error message onto the reader error taxonomy
pub fn classify_rpc_error(message: &str, from: u64, to: u64) -> ChainReadError {
    let lower = message.to_lowercase();

    if lower.contains("query returned more than")
        || lower.contains("block range")
        || lower.contains("range too large")
        || lower.contains("limit exceeded")
        || lower.contains("too many results")
        || lower.contains("response size exceeded")
        || lower.contains("max results")
    {
        return ChainReadError::RangeTooLarge {
            from,
            to,
            reason: message.to_string(),
        };
    }

    ChainReadError::Connection(message.to_string())
}

/// Decode a `TokensLocked` log.
///
/// Indexed topics:
///   topics[0] = event signature
///   topics[1] = token (address)
///   topics[2] = sender (address)
///   topics[3] = destinationChainId (uint256)
///
/// Non-indexed data (abi encoded):
///   recipient (bytes, dynamic: head offset then length-prefixed tail)
///   amount (uint256)
pub fn decode_lock_log(log: &Log, expected_topic0: B256) -> Result<BridgeEvent, DecodeError> {
    let context = |reason: String| DecodeError {
        tx_hash: log.transaction_hash,
        log_index: log.log_index,
        block_number: log.block_number,
        reason,
    };

    let source_tx_hash = log
        .transaction_hash
        .ok_or_else(|| context("missing transaction hash".to_string()))?;
    let log_index = log
        .log_index
        .ok_or_else(|| context("missing log index".to_string()))?;
    let block_number = log
        .block_number
        .ok_or_else(|| context("missing block number".to_string()))?;

    let topics = log.topics();
    if topics.len() != 4 {
        return Err(context(format!("expected 4 topics, got {}", topics.len())));
    }
    if topics[0] != expected_topic0 {
        return Err(context(format!("unexpected topic0 {}", topics[0])));
    }

    let asset_id = Address::from_word(topics[1]);
    let sender = Address::from_word(topics[2]);
    let destination_chain_id = U256::from_be_bytes(topics[3].0);

    let data = log.data().data.as_ref();
    let word = |offset: usize| -> Result<&[u8], DecodeError> {
        data.get(offset..offset + 32)
            .ok_or_else(|| context(format!("data truncated at byte {}", offset)))
    };

    let recipient_offset = word_to_usize(word(0)?)
        .ok_or_else(|| context("recipient offset out of range".to_string()))?;
    let amount = U256::from_be_slice(word(32)?);

    let recipient_len = word_to_usize(word(recipient_offset)?)
        .ok_or_else(|| context("recipient length out of range".to_string()))?;
    let start = recipient_offset + 32;
    let recipient = data
        .get(start..start.saturating_add(recipient_len))
        .filter(|slice| slice.len() == recipient_len)
        .ok_or_else(|| context(format!("recipient of {} bytes truncated", recipient_len)))?;

    Ok(BridgeEvent {
        source_tx_hash,
        log_index,
        block_number,
        asset_id,
        sender,
        recipient: Bytes::copy_from_slice(recipient),
        amount,
        destination_chain_id,
    })
}

fn word_to_usize(word: &[u8]) -> Option<usize> {
    let value = U256::from_be_slice(word);
    if value > U256::from(u32::MAX) {
        return None;
    }
    Some(value.to::<u64>() as usize)
}
