//! Watcher configuration
//!
//! Loaded once at startup from the environment (a `.env` file is honoured).
//! Any missing or inconsistent value is fatal.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::Address;
use eyre::{eyre, Result};

use crate::chain_reader::parse_rpc_urls;
use crate::retry::BackoffConfig;
use crate::watcher::WatcherSettings;

pub const DEFAULT_LOCK_EVENT_SIGNATURE: &str =
    "TokensLocked(address,address,bytes,uint256,uint256)";

/// Minimum ratio between the dedup window and the batch size
pub const RETRY_FACTOR: u64 = 4;

/// Source chain being watched
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub chain_name: String,
    /// Primary first, then fallbacks
    pub rpc_urls: Vec<String>,
    pub bridge_address: Address,
    pub event_signature: String,
    pub confirmations: u64,
    /// First block to scan when no checkpoint exists
    pub start_block: Option<u64>,
}

/// How validated events are acted on
#[derive(Clone)]
pub enum DispatchMode {
    /// Log the mint without broadcasting
    Simulate,
    Evm {
        rpc_url: String,
        minter_address: String,
        private_key: String,
    },
}

impl fmt::Debug for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Simulate => f.write_str("Simulate"),
            DispatchMode::Evm {
                rpc_url,
                minter_address,
                ..
            } => f
                .debug_struct("Evm")
                .field("rpc_url", rpc_url)
                .field("minter_address", minter_address)
                .field("private_key", &"<redacted>")
                .finish(),
        }
    }
}

/// Destination side
#[derive(Debug, Clone)]
pub struct DestinationConfig {
    pub chain_name: String,
    pub mode: DispatchMode,
    pub timeout: Duration,
}

/// External validation oracle
#[derive(Clone)]
pub struct OracleConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl fmt::Debug for OracleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OracleConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Scan loop tuning
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub poll_interval: Duration,
    pub rpc_timeout: Duration,
    pub max_batch_size: u64,
    pub dedup_window_blocks: u64,
    pub reorg_rescan_blocks: u64,
    pub max_concurrent_events: usize,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub backoff_multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointBackend {
    File { path: PathBuf },
    Postgres { database_url: String },
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Health / metrics server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

/// Bridge watcher configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Scopes checkpoint rows and stats
    pub watcher_id: String,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub oracle: OracleConfig,
    pub watcher: LoopConfig,
    pub checkpoint: CheckpointBackend,
    pub server: ServerConfig,
    pub log_format: LogFormat,
}

fn required(name: &str) -> Result<String> {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| eyre!("{} environment variable is required", name))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match optional(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| eyre!("{} has invalid value {:?}: {}", name, raw, e)),
        None => Ok(default),
    }
}

fn millis(name: &str, default: u64) -> Result<Duration> {
    parse_or(name, default).map(Duration::from_millis)
}

impl Config {
    /// Load configuration from environment
    pub fn load() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded .env from {:?}", path);
        }

        let rpc_urls = parse_rpc_urls(&required("SOURCE_RPC_URL")?);
        if rpc_urls.is_empty() {
            return Err(eyre!("SOURCE_RPC_URL cannot be empty"));
        }
        let bridge_address = Address::from_str(required("SOURCE_BRIDGE_ADDRESS")?.trim())
            .map_err(|e| eyre!("SOURCE_BRIDGE_ADDRESS is not a valid address: {}", e))?;

        let source = SourceConfig {
            chain_name: optional("SOURCE_CHAIN_NAME").unwrap_or_else(|| "Ethereum".to_string()),
            rpc_urls,
            bridge_address,
            event_signature: optional("LOCK_EVENT_SIGNATURE")
                .unwrap_or_else(|| DEFAULT_LOCK_EVENT_SIGNATURE.to_string()),
            confirmations: parse_or("CONFIRMATIONS", 0)?,
            start_block: optional("START_BLOCK")
                .map(|raw| {
                    raw.trim()
                        .parse()
                        .map_err(|e| eyre!("START_BLOCK has invalid value {:?}: {}", raw, e))
                })
                .transpose()?,
        };

        let mode = match optional("DISPATCH_MODE")
            .unwrap_or_else(|| "simulate".to_string())
            .to_lowercase()
            .as_str()
        {
            "simulate" => DispatchMode::Simulate,
            "evm" => DispatchMode::Evm {
                rpc_url: required("DEST_RPC_URL")?,
                minter_address: required("DEST_MINTER_ADDRESS")?,
                private_key: required("DEST_PRIVATE_KEY")?,
            },
            other => return Err(eyre!("DISPATCH_MODE must be simulate or evm, got {}", other)),
        };

        let destination = DestinationConfig {
            chain_name: optional("DEST_CHAIN_NAME").unwrap_or_else(|| "Polygon".to_string()),
            mode,
            timeout: millis("DISPATCH_TIMEOUT_MS", 120_000)?,
        };

        let oracle = OracleConfig {
            url: required("ORACLE_URL")?,
            api_key: optional("ORACLE_API_KEY"),
            timeout: millis("ORACLE_TIMEOUT_MS", 10_000)?,
        };

        let max_batch_size: u64 = parse_or("MAX_BATCH_SIZE", 100)?;
        let watcher = LoopConfig {
            poll_interval: millis("POLL_INTERVAL_MS", 15_000)?,
            rpc_timeout: millis("RPC_TIMEOUT_MS", 30_000)?,
            max_batch_size,
            dedup_window_blocks: parse_or(
                "DEDUP_WINDOW_BLOCKS",
                max_batch_size.saturating_mul(RETRY_FACTOR),
            )?,
            reorg_rescan_blocks: parse_or("REORG_RESCAN_BLOCKS", 0)?,
            max_concurrent_events: parse_or("MAX_CONCURRENT_EVENTS", 1)?,
            backoff_initial: millis("BACKOFF_INITIAL_MS", 2_000)?,
            backoff_max: millis("BACKOFF_MAX_MS", 60_000)?,
            backoff_multiplier: parse_or("BACKOFF_MULTIPLIER", 2.0)?,
        };

        let checkpoint = match optional("CHECKPOINT_BACKEND")
            .unwrap_or_else(|| "file".to_string())
            .to_lowercase()
            .as_str()
        {
            "file" => CheckpointBackend::File {
                path: optional("CHECKPOINT_PATH")
                    .unwrap_or_else(|| "bridge-watcher-checkpoint.json".to_string())
                    .into(),
            },
            "postgres" => CheckpointBackend::Postgres {
                database_url: required("DATABASE_URL")?,
            },
            "memory" => CheckpointBackend::Memory,
            other => {
                return Err(eyre!(
                    "CHECKPOINT_BACKEND must be file, postgres or memory, got {}",
                    other
                ))
            }
        };

        let log_format = match optional("LOG_FORMAT")
            .unwrap_or_else(|| "text".to_string())
            .to_lowercase()
            .as_str()
        {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => return Err(eyre!("LOG_FORMAT must be text or json, got {}", other)),
        };

        let server = ServerConfig {
            bind_address: optional("HEALTH_BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0".to_string()),
            // Default health port 9099, clear of the usual node ports
            port: parse_or("HEALTH_PORT", 9099)?,
        };

        let watcher_id = optional("WATCHER_ID").unwrap_or_else(|| {
            format!(
                "{}-{}",
                source.chain_name.to_lowercase(),
                source.bridge_address.to_string().to_lowercase()
            )
        });

        let config = Config {
            watcher_id,
            source,
            destination,
            oracle,
            watcher,
            checkpoint,
            server,
            log_format,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let w = &self.watcher;

        if w.max_batch_size == 0 {
            return Err(eyre!("MAX_BATCH_SIZE must be at least 1"));
        }
        if w.max_concurrent_events == 0 {
            return Err(eyre!("MAX_CONCURRENT_EVENTS must be at least 1"));
        }

        // A retried range must still find its keys in the window
        let minimum_window = w.max_batch_size.saturating_mul(RETRY_FACTOR);
        if w.dedup_window_blocks < minimum_window {
            return Err(eyre!(
                "DEDUP_WINDOW_BLOCKS ({}) must be at least MAX_BATCH_SIZE x {} ({})",
                w.dedup_window_blocks,
                RETRY_FACTOR,
                minimum_window
            ));
        }
        if w.reorg_rescan_blocks >= w.dedup_window_blocks {
            return Err(eyre!(
                "REORG_RESCAN_BLOCKS ({}) must be smaller than DEDUP_WINDOW_BLOCKS ({})",
                w.reorg_rescan_blocks,
                w.dedup_window_blocks
            ));
        }

        if w.backoff_multiplier < 1.0 || !w.backoff_multiplier.is_finite() {
            return Err(eyre!("BACKOFF_MULTIPLIER must be a finite value >= 1.0"));
        }
        if w.backoff_initial > w.backoff_max {
            return Err(eyre!("BACKOFF_INITIAL_MS cannot exceed BACKOFF_MAX_MS"));
        }

        for (name, value) in [
            ("POLL_INTERVAL_MS", w.poll_interval),
            ("RPC_TIMEOUT_MS", w.rpc_timeout),
            ("ORACLE_TIMEOUT_MS", self.oracle.timeout),
            ("DISPATCH_TIMEOUT_MS", self.destination.timeout),
        ] {
            if value.is_zero() {
                return Err(eyre!("{} must be greater than zero", name));
            }
        }

        if self.source.event_signature.trim().is_empty() {
            return Err(eyre!("LOCK_EVENT_SIGNATURE cannot be empty"));
        }

        url::Url::parse(&self.oracle.url)
            .map_err(|e| eyre!("ORACLE_URL is not a valid URL: {}", e))?;

        if let DispatchMode::Evm {
            minter_address,
            private_key,
            ..
        } = &self.destination.mode
        {
            if Address::from_str(minter_address).is_err() {
                return Err(eyre!("DEST_MINTER_ADDRESS must be a valid EVM address"));
            }
            if private_key.len() != 66 || !private_key.starts_with("0x") {
                return Err(eyre!("DEST_PRIVATE_KEY must be 66 chars (0x + 64 hex chars)"));
            }
            if hex::decode(&private_key[2..]).is_err() {
                return Err(eyre!("DEST_PRIVATE_KEY contains non-hex characters"));
            }
        }

        Ok(())
    }

    pub fn watcher_settings(&self) -> WatcherSettings {
        WatcherSettings {
            watcher_id: self.watcher_id.clone(),
            event_signature: self.source.event_signature.clone(),
            confirmations: self.source.confirmations,
            max_batch_size: self.watcher.max_batch_size,
            reorg_rescan_blocks: self.watcher.reorg_rescan_blocks,
            max_concurrent_events: self.watcher.max_concurrent_events,
            poll_interval: self.watcher.poll_interval,
            rpc_timeout: self.watcher.rpc_timeout,
            validation_timeout: self.oracle.timeout,
            dispatch_timeout: self.destination.timeout,
        }
    }

    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial_backoff: self.watcher.backoff_initial,
            max_backoff: self.watcher.backoff_max,
            backoff_multiplier: self.watcher.backoff_multiplier,
            ..Default::default()
        }
    }
}
