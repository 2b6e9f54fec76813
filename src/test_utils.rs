//! Deterministic in-process fakes for driving the watcher in tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;

use crate::chain_reader::ChainReader;
use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore, ScanCursor};
use crate::dispatcher::ActionDispatcher;
use crate::error::{ChainReadError, CheckpointError, DecodeError};
use crate::types::{ActionOutcome, ActionReceipt, BridgeEvent, EventKey, ValidationOutcome};
use crate::validator::Validator;

pub fn event_at(tx_byte: u8, log_index: u64, block_number: u64) -> BridgeEvent {
    BridgeEvent {
        source_tx_hash: B256::repeat_byte(tx_byte),
        log_index,
        block_number,
        asset_id: Address::repeat_byte(0x11),
        sender: Address::repeat_byte(0x22),
        recipient: Bytes::from(vec![0x33; 20]),
        amount: U256::from(1_000_000_000_000_000_000u128),
        destination_chain_id: U256::from(137u64),
    }
}

/// Chain with a settable head and a fixed set of events
#[derive(Default)]
pub struct FakeChainReader {
    head: Mutex<u64>,
    events: Mutex<Vec<BridgeEvent>>,
    undecodable: Mutex<Vec<DecodeError>>,
    /// Spans above this are refused with `RangeTooLarge`
    max_span: Mutex<Option<u64>>,
    fail_connection: AtomicBool,
    /// Return every event twice in the same response
    duplicate_delivery: AtomicBool,
    calls: Mutex<Vec<(u64, u64)>>,
}

impl FakeChainReader {
    pub fn new(head: u64) -> Self {
        let reader = Self::default();
        reader.set_head(head);
        reader
    }

    pub fn with_events(self, events: Vec<BridgeEvent>) -> Self {
        *self.events.lock().unwrap() = events;
        self
    }

    pub fn with_max_span(self, span: u64) -> Self {
        *self.max_span.lock().unwrap() = Some(span);
        self
    }

    pub fn with_duplicate_delivery(self) -> Self {
        self.duplicate_delivery.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_undecodable(self, err: DecodeError) -> Self {
        self.undecodable.lock().unwrap().push(err);
        self
    }

    pub fn set_head(&self, head: u64) {
        *self.head.lock().unwrap() = head;
    }

    pub fn set_connection_failure(&self, fail: bool) {
        self.fail_connection.store(fail, Ordering::SeqCst);
    }

    /// Every `get_events` range requested so far
    pub fn calls(&self) -> Vec<(u64, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainReader for FakeChainReader {
    async fn current_height(&self) -> Result<u64, ChainReadError> {
        if self.fail_connection.load(Ordering::SeqCst) {
            return Err(ChainReadError::Connection("connection refused".to_string()));
        }
        Ok(*self.head.lock().unwrap())
    }

    async fn get_events(
        &self,
        from: u64,
        to: u64,
        _event_signature: &str,
    ) -> Result<Vec<Result<BridgeEvent, DecodeError>>, ChainReadError> {
        self.calls.lock().unwrap().push((from, to));

        if self.fail_connection.load(Ordering::SeqCst) {
            return Err(ChainReadError::Connection("connection refused".to_string()));
        }
        if let Some(max) = *self.max_span.lock().unwrap() {
            if to - from + 1 > max {
                return Err(ChainReadError::RangeTooLarge {
                    from,
                    to,
                    reason: format!("query returned more than {} blocks", max),
                });
            }
        }

        let copies = if self.duplicate_delivery.load(Ordering::SeqCst) {
            2
        } else {
            1
        };
        let mut out = Vec::new();
        for event in self.events.lock().unwrap().iter() {
            if event.block_number >= from && event.block_number <= to {
                for _ in 0..copies {
                    out.push(Ok(event.clone()));
                }
            }
        }
        for err in self.undecodable.lock().unwrap().iter() {
            if err.block_number.is_some_and(|b| b >= from && b <= to) {
                out.push(Err(err.clone()));
            }
        }
        Ok(out)
    }
}

/// Validator answering from a per-key script, then a default outcome
pub struct ScriptedValidator {
    default: ValidationOutcome,
    script: Mutex<HashMap<EventKey, VecDeque<ValidationOutcome>>>,
    calls: Mutex<Vec<EventKey>>,
    delay: Option<Duration>,
}

impl ScriptedValidator {
    pub fn approving() -> Self {
        Self::always(ValidationOutcome::Approved)
    }

    pub fn always(default: ValidationOutcome) -> Self {
        Self {
            default,
            script: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue outcomes returned for `key` before falling back to the default
    pub fn script(self, key: EventKey, outcomes: Vec<ValidationOutcome>) -> Self {
        self.script
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .extend(outcomes);
        self
    }

    pub fn calls_for(&self, key: &EventKey) -> usize {
        self.calls.lock().unwrap().iter().filter(|k| *k == key).count()
    }
}

#[async_trait]
impl Validator for ScriptedValidator {
    async fn validate(&self, event: &BridgeEvent) -> ValidationOutcome {
        self.calls.lock().unwrap().push(event.key());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(&event.key())
            .and_then(|queue| queue.pop_front());
        scripted.unwrap_or_else(|| self.default.clone())
    }
}

/// Dispatcher recording every call, optionally scripted to fail
#[derive(Default)]
pub struct RecordingDispatcher {
    script: Mutex<HashMap<EventKey, VecDeque<ActionOutcome>>>,
    dispatched: Mutex<Vec<EventKey>>,
    /// Cursor height persisted at the moment of each dispatch
    observed_heights: Mutex<Vec<u64>>,
    observed_store: Option<Arc<MemoryCheckpointStore>>,
    delay: Option<Duration>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observed_store(mut self, store: Arc<MemoryCheckpointStore>) -> Self {
        self.observed_store = Some(store);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn script(self, key: EventKey, outcomes: Vec<ActionOutcome>) -> Self {
        self.script
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .extend(outcomes);
        self
    }

    pub fn dispatched(&self) -> Vec<EventKey> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn count_for(&self, key: &EventKey) -> usize {
        self.dispatched().iter().filter(|k| *k == key).count()
    }

    pub fn observed_heights(&self) -> Vec<u64> {
        self.observed_heights.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionDispatcher for RecordingDispatcher {
    async fn dispatch(&self, event: &BridgeEvent) -> ActionOutcome {
        let key = event.key();
        self.dispatched.lock().unwrap().push(key);
        if let Some(store) = &self.observed_store {
            let height = store.snapshot().map(|c| c.last_scanned_height).unwrap_or(0);
            self.observed_heights.lock().unwrap().push(height);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());
        scripted.unwrap_or_else(|| {
            ActionOutcome::Submitted(ActionReceipt {
                tx_id: format!("fake-{}", key),
                simulated: true,
            })
        })
    }
}

/// Memory store whose writes can be switched to fail
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryCheckpointStore,
    fail_writes: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Option<ScanCursor> {
        self.inner.snapshot()
    }

    fn check(&self) -> Result<(), CheckpointError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CheckpointError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FailingStore {
    async fn load(&self) -> Result<Option<ScanCursor>, CheckpointError> {
        self.inner.load().await
    }

    async fn record_processed(
        &self,
        cursor: &ScanCursor,
        key: &EventKey,
        block_number: u64,
    ) -> Result<(), CheckpointError> {
        self.check()?;
        self.inner.record_processed(cursor, key, block_number).await
    }

    async fn record_commit(&self, cursor: &ScanCursor) -> Result<(), CheckpointError> {
        self.check()?;
        self.inner.record_commit(cursor).await
    }

    async fn record_eviction(
        &self,
        cursor: &ScanCursor,
        cutoff: u64,
    ) -> Result<(), CheckpointError> {
        self.check()?;
        self.inner.record_eviction(cursor, cutoff).await
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "failing-memory".to_string()
    }
}
