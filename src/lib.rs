//! Bridge watcher library
//!
//! Watches a source-chain bridge contract for lock events, checks each one
//! with an external validator, and dispatches the matching destination mint
//! exactly once per `(source_tx_hash, log_index)`.

pub mod chain_reader;
pub mod checkpoint;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod server;
pub mod types;
pub mod validator;
pub mod watcher;

#[cfg(test)]
pub(crate) mod test_utils;
