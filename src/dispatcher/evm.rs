//! EVM minter dispatcher
//!
//! Signs and submits `mint` transactions on the destination chain.
//!
//! # Idempotency
//!
//! The minter records every `(sourceTxHash, logIndex)` it has minted for.
//! Before sending, the dispatcher asks `isProcessed` and reports an already
//! minted event as submitted, so a retry after a lost receipt or a timeout
//! never mints twice.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use std::str::FromStr;
use tracing::{debug, error, info, warn};

use super::ActionDispatcher;
use crate::retry::classify_error;
use crate::types::{ActionOutcome, ActionReceipt, BridgeEvent};

sol! {
    /// Destination minter interface
    #[sol(rpc)]
    contract BridgeMinter {
        /// Mint wrapped tokens for a source-chain lock
        function mint(
            bytes recipient,
            uint256 amount,
            address assetId,
            bytes32 sourceTxHash,
            uint256 logIndex
        ) external;

        /// Whether a source lock has already been minted for
        function isProcessed(bytes32 sourceTxHash, uint256 logIndex) external view returns (bool processed);
    }
}

/// Dispatcher that mints on an EVM destination chain
pub struct EvmMintDispatcher {
    rpc_url: url::Url,
    minter_address: Address,
    signer: PrivateKeySigner,
}

impl EvmMintDispatcher {
    pub fn new(rpc_url: &str, minter_address: &str, private_key: &str) -> Result<Self> {
        let rpc_url = rpc_url.parse().wrap_err("Invalid destination RPC URL")?;
        let minter_address =
            Address::from_str(minter_address).wrap_err("Invalid minter address")?;
        let signer: PrivateKeySigner = private_key.parse().wrap_err("Invalid private key")?;

        info!(
            minter_signer = %signer.address(),
            minter = %minter_address,
            "EVM mint dispatcher initialized"
        );

        Ok(Self {
            rpc_url,
            minter_address,
            signer,
        })
    }

    pub fn signer_address(&self) -> Address {
        self.signer.address()
    }

    fn failed(event: &BridgeEvent, stage: &str, message: String) -> ActionOutcome {
        let class = classify_error(&message);
        let retryable = class.is_retryable();
        if retryable {
            warn!(
                tx_hash = %event.source_tx_hash,
                log_index = event.log_index,
                block_number = event.block_number,
                stage,
                error_class = ?class,
                error = %message,
                "Mint attempt failed, will retry"
            );
        } else {
            error!(
                tx_hash = %event.source_tx_hash,
                log_index = event.log_index,
                block_number = event.block_number,
                stage,
                error = %message,
                "Mint failed permanently"
            );
        }
        ActionOutcome::Failed {
            cause: format!("{}: {}", stage, message),
            retryable,
        }
    }
}

#[async_trait]
impl ActionDispatcher for EvmMintDispatcher {
    async fn dispatch(&self, event: &BridgeEvent) -> ActionOutcome {
        // Recommended fillers populate nonce, gas limit and EIP-1559 fees
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url.clone());

        let contract = BridgeMinter::new(self.minter_address, &provider);
        let source_tx_hash: B256 = event.source_tx_hash;
        let log_index = U256::from(event.log_index);

        match contract.isProcessed(source_tx_hash, log_index).call().await {
            Ok(result) if result.processed => {
                info!(
                    tx_hash = %event.source_tx_hash,
                    log_index = event.log_index,
                    "Source lock already minted on destination, skipping send"
                );
                return ActionOutcome::Submitted(ActionReceipt {
                    tx_id: format!("already-processed:{}", event.key()),
                    simulated: false,
                });
            }
            Ok(_) => {}
            // A failed view call says nothing about the event, so never poison it
            Err(e) => {
                warn!(
                    tx_hash = %event.source_tx_hash,
                    log_index = event.log_index,
                    error = %e,
                    "isProcessed check failed, will retry"
                );
                return ActionOutcome::Failed {
                    cause: format!("isProcessed: {}", e),
                    retryable: true,
                };
            }
        }

        debug!(
            tx_hash = %event.source_tx_hash,
            log_index = event.log_index,
            recipient = %event.recipient,
            amount = %event.amount,
            "Submitting mint"
        );

        let call = contract.mint(
            event.recipient.clone(),
            event.amount,
            event.asset_id,
            source_tx_hash,
            log_index,
        );

        let pending_tx = match call.send().await {
            Ok(pending) => pending,
            Err(e) => return Self::failed(event, "send", e.to_string()),
        };

        let tx_hash = *pending_tx.tx_hash();
        info!(tx_hash = %tx_hash, source_tx_hash = %event.source_tx_hash, "Mint transaction sent");

        let receipt = match pending_tx.get_receipt().await {
            Ok(receipt) => receipt,
            // The tx may still land; the isProcessed check covers the retry
            Err(e) => {
                return ActionOutcome::Failed {
                    cause: format!("receipt for {}: {}", tx_hash, e),
                    retryable: true,
                }
            }
        };

        if !receipt.status() {
            error!(
                tx_hash = %tx_hash,
                source_tx_hash = %event.source_tx_hash,
                log_index = event.log_index,
                block_number = event.block_number,
                "Mint transaction reverted"
            );
            return ActionOutcome::Failed {
                cause: format!("mint {} reverted", tx_hash),
                retryable: false,
            };
        }

        info!(
            tx_hash = %tx_hash,
            source_tx_hash = %event.source_tx_hash,
            log_index = event.log_index,
            "Mint confirmed on destination"
        );

        ActionOutcome::Submitted(ActionReceipt {
            tx_id: format!("0x{:x}", tx_hash),
            simulated: false,
        })
    }
}
