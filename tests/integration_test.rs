//! Integration tests for the bridge watcher
//!
//! These tests require a local Anvil node on localhost:8545, and the
//! checkpoint tests a PostgreSQL database reachable through DATABASE_URL.
//!
//! Run with: cargo test --test integration_test -- --ignored --nocapture
//! Or set INTEGRATION_TEST=1 and run: cargo test --test integration_test
//!
//! Optional environment variables:
//! - EVM_RPC_URL (default: http://localhost:8545)
//! - EVM_BRIDGE_ADDRESS (default: an address with no code, so no events)
//! - DATABASE_URL (required for the checkpoint database tests)

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use httpmock::prelude::*;
use serde_json::json;

use bridge_watcher::chain_reader::{ChainReader, EvmChainReader};
use bridge_watcher::checkpoint::{Checkpoint, MemoryCheckpointStore, PgCheckpointStore};
use bridge_watcher::config::DEFAULT_LOCK_EVENT_SIGNATURE;
use bridge_watcher::dispatcher::SimulatedDispatcher;
use bridge_watcher::retry::BackoffConfig;
use bridge_watcher::validator::OracleValidator;
use bridge_watcher::watcher::{BridgeWatcher, WatcherSettings, WatcherState};

/// Check if integration tests should run
fn should_run_integration() -> bool {
    env::var("INTEGRATION_TEST").is_ok() || env::var("CI").is_ok()
}

fn evm_rpc_url() -> String {
    env::var("EVM_RPC_URL").unwrap_or_else(|_| "http://localhost:8545".to_string())
}

fn bridge_address() -> Address {
    env::var("EVM_BRIDGE_ADDRESS")
        .ok()
        .and_then(|raw| Address::from_str(&raw).ok())
        .unwrap_or(Address::repeat_byte(0x42))
}

fn reader() -> EvmChainReader {
    EvmChainReader::new(&[evm_rpc_url()], bridge_address()).expect("valid RPC url")
}

// ============================================================================
// Chain reader against a live node
// ============================================================================

mod chain_reader {
    use super::*;

    #[tokio::test]
    #[ignore = "requires Anvil running"]
    async fn test_current_height() {
        if !should_run_integration() {
            return;
        }
        let height = reader().current_height().await.expect("Anvil reachable");
        println!("Anvil block number: {}", height);
    }

    #[tokio::test]
    #[ignore = "requires Anvil running"]
    async fn test_get_events_over_full_range() {
        if !should_run_integration() {
            return;
        }
        let reader = reader();
        let head = reader.current_height().await.expect("Anvil reachable");

        let events = reader
            .get_events(0, head, DEFAULT_LOCK_EVENT_SIGNATURE)
            .await
            .expect("log query succeeds on a dev chain");

        for event in events.iter().flatten() {
            assert!(event.block_number <= head);
        }
        println!("Found {} lock logs in [0, {}]", events.len(), head);
    }

    #[tokio::test]
    #[ignore = "requires Anvil running"]
    async fn test_unreachable_fallback_is_skipped() {
        if !should_run_integration() {
            return;
        }
        let reader = EvmChainReader::new(
            &["http://127.0.0.1:9".to_string(), evm_rpc_url()],
            bridge_address(),
        )
        .unwrap();

        assert!(reader.current_height().await.is_ok());
    }
}

// ============================================================================
// Full watcher cycle
// ============================================================================

mod watcher {
    use super::*;

    #[tokio::test]
    #[ignore = "requires Anvil running"]
    async fn test_fresh_watcher_anchors_and_commits() {
        if !should_run_integration() {
            return;
        }

        let oracle = MockServer::start_async().await;
        oracle
            .mock_async(|when, then| {
                when.method(POST).path("/validate");
                then.status(200).json_body(json!({ "isValid": true }));
            })
            .await;

        let reader = Arc::new(reader());
        let head = reader.current_height().await.expect("Anvil reachable");

        let checkpoint = Checkpoint::open(Arc::new(MemoryCheckpointStore::new()), 400, None)
            .await
            .unwrap();
        let validator = Arc::new(
            OracleValidator::new(oracle.url("/validate"), None, "Anvil", Duration::from_secs(5))
                .unwrap(),
        );
        let dispatcher = Arc::new(SimulatedDispatcher::new("Anvil", "simulated-minter"));

        let mut watcher = BridgeWatcher::new(
            reader,
            validator,
            dispatcher,
            checkpoint,
            WatcherSettings {
                watcher_id: "integration".to_string(),
                poll_interval: Duration::from_millis(100),
                ..Default::default()
            },
            BackoffConfig::default(),
        );

        let state = watcher.run_cycle().await;
        assert!(
            !matches!(state, WatcherState::Backoff { .. }),
            "unexpected backoff: {:?}",
            state
        );
        assert!(!watcher.checkpoint().needs_anchor());
        assert!(watcher.checkpoint().last_scanned_height() <= head + 1);

        let stats = watcher.stats();
        assert!(stats.read().await.anchored);
    }
}

// ============================================================================
// PostgreSQL checkpoint store
// ============================================================================

mod checkpoint_db {
    use super::*;
    use alloy::primitives::B256;
    use bridge_watcher::types::EventKey;

    fn database_url() -> Option<String> {
        env::var("DATABASE_URL").ok()
    }

    /// Fresh watcher id per run so rows from earlier runs never interfere
    fn unique_watcher_id(prefix: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("{}-{}", prefix, nanos)
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL running"]
    async fn test_start_block_survives_crash_before_first_commit() {
        let Some(url) = database_url().filter(|_| should_run_integration()) else {
            return;
        };
        let watcher_id = unique_watcher_id("start-block");
        let key = EventKey::new(B256::repeat_byte(0xab), 0);

        {
            let store = Arc::new(PgCheckpointStore::connect(&url, &watcher_id).await.unwrap());
            let mut cp = Checkpoint::open(store, 400, Some(18_000_000)).await.unwrap();
            cp.mark_processed(key, 18_000_005).await.unwrap();
        }

        let store = Arc::new(PgCheckpointStore::connect(&url, &watcher_id).await.unwrap());
        let cp = Checkpoint::open(store, 400, None).await.unwrap();
        assert_eq!(cp.last_scanned_height(), 17_999_999);
        assert!(cp.is_processed(&key));
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL running"]
    async fn test_commit_and_eviction_round_trip() {
        let Some(url) = database_url().filter(|_| should_run_integration()) else {
            return;
        };
        let watcher_id = unique_watcher_id("evict");

        {
            let store = Arc::new(PgCheckpointStore::connect(&url, &watcher_id).await.unwrap());
            let mut cp = Checkpoint::open(store, 400, Some(1)).await.unwrap();
            cp.mark_processed(EventKey::new(B256::repeat_byte(1), 0), 10)
                .await
                .unwrap();
            cp.mark_processed(EventKey::new(B256::repeat_byte(2), 0), 900)
                .await
                .unwrap();
            cp.commit(1000).await.unwrap();
            assert_eq!(cp.evict_older_than(1000).await.unwrap(), 1);
        }

        let store = Arc::new(PgCheckpointStore::connect(&url, &watcher_id).await.unwrap());
        let cp = Checkpoint::open(store, 400, None).await.unwrap();
        assert_eq!(cp.last_scanned_height(), 1000);
        assert_eq!(cp.processed_len(), 1);
        assert!(cp.is_processed(&EventKey::new(B256::repeat_byte(2), 0)));
    }
}
