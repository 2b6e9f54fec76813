//! HTTP oracle validator
//!
//! POSTs the event to an external verification service and trusts only an
//! explicit `{"isValid": true}` answer.

use std::time::Duration;

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::Validator;
use crate::types::{BridgeEvent, ValidationOutcome};

const DEFAULT_REJECT_REASON: &str = "oracle reported event as invalid";

/// Request body sent to the oracle
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleRequest {
    pub source_tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub source_chain: String,
    pub sender: String,
    pub recipient: String,
    pub amount: String,
    pub asset_id: String,
}

impl OracleRequest {
    pub fn from_event(event: &BridgeEvent, source_chain: &str) -> Self {
        Self {
            source_tx_hash: event.source_tx_hash.to_string(),
            log_index: event.log_index,
            block_number: event.block_number,
            source_chain: source_chain.to_string(),
            sender: event.sender.to_checksum(None),
            recipient: event.recipient.to_string(),
            amount: event.amount.to_string(),
            asset_id: event.asset_id.to_checksum(None),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OracleResponse {
    is_valid: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Validator backed by an HTTP oracle
pub struct OracleValidator {
    client: Client,
    url: String,
    api_key: Option<String>,
    source_chain: String,
}

impl OracleValidator {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        source_chain: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("Failed to build oracle HTTP client")?;
        let url = url.into();

        info!(oracle = %url, timeout_ms = timeout.as_millis() as u64, "Oracle validator initialized");

        Ok(Self {
            client,
            url,
            api_key,
            source_chain: source_chain.into(),
        })
    }
}

#[async_trait]
impl Validator for OracleValidator {
    async fn validate(&self, event: &BridgeEvent) -> ValidationOutcome {
        let body = OracleRequest::from_event(event, &self.source_chain);

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let cause = if e.is_timeout() {
                    format!("oracle timed out: {}", e)
                } else {
                    format!("oracle unreachable: {}", e)
                };
                warn!(
                    tx_hash = %event.source_tx_hash,
                    log_index = event.log_index,
                    error = %e,
                    "Oracle request failed"
                );
                return ValidationOutcome::Indeterminate(cause);
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(
                tx_hash = %event.source_tx_hash,
                log_index = event.log_index,
                status = %status,
                "Oracle returned non-success status"
            );
            return ValidationOutcome::Indeterminate(format!("oracle returned HTTP {}", status));
        }

        let parsed: OracleResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    tx_hash = %event.source_tx_hash,
                    log_index = event.log_index,
                    error = %e,
                    "Oracle response could not be parsed"
                );
                return ValidationOutcome::Indeterminate(format!("malformed oracle response: {}", e));
            }
        };

        debug!(
            tx_hash = %event.source_tx_hash,
            log_index = event.log_index,
            is_valid = parsed.is_valid,
            "Oracle answered"
        );

        if parsed.is_valid {
            ValidationOutcome::Approved
        } else {
            ValidationOutcome::Rejected(
                parsed
                    .reason
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_REJECT_REASON.to_string()),
            )
        }
    }
}
