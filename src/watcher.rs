//! Bridge watcher state machine
//!
//! Drives one source chain / contract pair:
//!
//! ```text
//! Idle -> Polling -> Scanning -> Draining -> Committing -> Polling
//!             \          \           \            \
//!              +----------+-----------+------------+--> Backoff -> Polling
//! ```
//!
//! The checkpoint is owned here and mutated only between network calls, so
//! every progress change is serialized through this loop. An event is
//! recorded as processed only once it reached a final disposition (action
//! submitted, rejected, or dropped after a permanent dispatch failure).
//! Anything else leaves the cursor below the event's block so it is
//! re-read on the next pass.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use futures::future::join_all;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::chain_reader::ChainReader;
use crate::checkpoint::Checkpoint;
use crate::dispatcher::ActionDispatcher;
use crate::error::ChainReadError;
use crate::metrics::Metrics;
use crate::retry::{Backoff, BackoffConfig};
use crate::server::{SharedStats, WatcherStats};
use crate::types::{ActionOutcome, ActionReceipt, BridgeEvent, ScanRange, ValidationOutcome};
use crate::validator::Validator;

/// Loop tuning, independent of which components are plugged in
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub watcher_id: String,
    pub event_signature: String,
    /// Blocks below the head that are not yet considered safe
    pub confirmations: u64,
    pub max_batch_size: u64,
    /// Already-scanned blocks re-read at the start of every range
    pub reorg_rescan_blocks: u64,
    pub max_concurrent_events: usize,
    pub poll_interval: Duration,
    pub rpc_timeout: Duration,
    pub validation_timeout: Duration,
    pub dispatch_timeout: Duration,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            watcher_id: "bridge-watcher".to_string(),
            event_signature: crate::config::DEFAULT_LOCK_EVENT_SIGNATURE.to_string(),
            confirmations: 0,
            max_batch_size: 100,
            reorg_rescan_blocks: 0,
            max_concurrent_events: 1,
            poll_interval: Duration::from_secs(15),
            rpc_timeout: Duration::from_secs(30),
            validation_timeout: Duration::from_secs(10),
            dispatch_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatcherState {
    /// Caught up; wait one poll interval
    Idle,
    Polling,
    Scanning { range: ScanRange },
    Draining { range: ScanRange, events: Vec<BridgeEvent> },
    /// `first_unresolved` is the lowest block holding an event that still
    /// needs another attempt
    Committing { range: ScanRange, first_unresolved: Option<u64> },
    Backoff { cause: String, delay: Duration },
}

impl WatcherState {
    pub fn name(&self) -> &'static str {
        match self {
            WatcherState::Idle => "idle",
            WatcherState::Polling => "polling",
            WatcherState::Scanning { .. } => "scanning",
            WatcherState::Draining { .. } => "draining",
            WatcherState::Committing { .. } => "committing",
            WatcherState::Backoff { .. } => "backoff",
        }
    }
}

/// What happened to one event during a drain
#[derive(Debug, Clone, PartialEq)]
pub enum EventDisposition {
    Dispatched(ActionReceipt),
    Rejected(String),
    /// Permanent dispatch failure; recorded so it does not block the cursor
    PoisonPill(String),
    Indeterminate(String),
    RetryableFailure(String),
}

impl EventDisposition {
    /// Whether the event is finished and must never be acted on again
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            EventDisposition::Dispatched(_)
                | EventDisposition::Rejected(_)
                | EventDisposition::PoisonPill(_)
        )
    }
}

pub struct BridgeWatcher {
    reader: Arc<dyn ChainReader>,
    validator: Arc<dyn Validator>,
    dispatcher: Arc<dyn ActionDispatcher>,
    checkpoint: Checkpoint,
    settings: WatcherSettings,
    backoff: Backoff,
    stats: SharedStats,
    metrics: Arc<Metrics>,
}

impl BridgeWatcher {
    pub fn new(
        reader: Arc<dyn ChainReader>,
        validator: Arc<dyn Validator>,
        dispatcher: Arc<dyn ActionDispatcher>,
        checkpoint: Checkpoint,
        settings: WatcherSettings,
        backoff: BackoffConfig,
    ) -> Self {
        let stats = WatcherStats {
            watcher_id: settings.watcher_id.clone(),
            state: WatcherState::Idle.name().to_string(),
            last_scanned_height: checkpoint.last_scanned_height(),
            processed_keys: checkpoint.processed_len(),
            anchored: !checkpoint.needs_anchor(),
            ..Default::default()
        };

        Self {
            reader,
            validator,
            dispatcher,
            checkpoint,
            settings,
            backoff: Backoff::new(backoff),
            stats: Arc::new(RwLock::new(stats)),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn stats(&self) -> SharedStats {
        self.stats.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Run until the shutdown channel fires or closes.
    ///
    /// Shutdown is observed before every transition and interrupts idle and
    /// backoff sleeps; an in-flight call is allowed to finish.
    pub async fn run(&mut self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        info!(
            watcher_id = %self.settings.watcher_id,
            last_scanned_height = self.checkpoint.last_scanned_height(),
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            max_batch_size = self.settings.max_batch_size,
            "Bridge watcher starting"
        );

        let mut state = WatcherState::Polling;
        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(mpsc::error::TryRecvError::Disconnected) => break,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }

            let pause = match &state {
                WatcherState::Idle => Some(self.settings.poll_interval),
                WatcherState::Backoff { delay, .. } => Some(*delay),
                _ => None,
            };
            if let Some(pause) = pause {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }

            state = self.step(state).await;
        }

        info!(
            watcher_id = %self.settings.watcher_id,
            last_scanned_height = self.checkpoint.last_scanned_height(),
            "Shutdown requested, bridge watcher stopped"
        );
        Ok(())
    }

    /// Run transitions from `Polling` until the loop would pause or start a
    /// new poll. Returns the state the loop stopped at.
    pub async fn run_cycle(&mut self) -> WatcherState {
        let mut state = self.step(WatcherState::Polling).await;
        loop {
            match state {
                WatcherState::Idle | WatcherState::Polling | WatcherState::Backoff { .. } => {
                    return state
                }
                other => state = self.step(other).await,
            }
        }
    }

    /// Perform the work of `state` and return the next state
    pub async fn step(&mut self, state: WatcherState) -> WatcherState {
        {
            let mut stats = self.stats.write().await;
            stats.state = state.name().to_string();
            stats.consecutive_failures = self.backoff.attempt();
        }

        match state {
            WatcherState::Idle | WatcherState::Backoff { .. } => WatcherState::Polling,
            WatcherState::Polling => self.poll().await,
            WatcherState::Scanning { range } => self.scan(range).await,
            WatcherState::Draining { range, events } => self.drain(range, events).await,
            WatcherState::Committing {
                range,
                first_unresolved,
            } => self.commit(range, first_unresolved).await,
        }
    }

    fn enter_backoff(&mut self, cause: String) -> WatcherState {
        let delay = self.backoff.next_delay();
        self.metrics.backoffs_total.inc();
        warn!(
            watcher_id = %self.settings.watcher_id,
            cause = %cause,
            attempt = self.backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "Backing off"
        );
        WatcherState::Backoff { cause, delay }
    }

    async fn poll(&mut self) -> WatcherState {
        let head = match timeout(self.settings.rpc_timeout, self.reader.current_height()).await {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => return self.enter_backoff(format!("current_height: {}", e)),
            Err(_) => {
                return self.enter_backoff(format!(
                    "current_height timed out after {:?}",
                    self.settings.rpc_timeout
                ))
            }
        };

        let safe_head = head.saturating_sub(self.settings.confirmations);
        self.metrics.chain_head.set(head as i64);

        if self.checkpoint.needs_anchor() {
            if let Err(e) = self.checkpoint.anchor(safe_head).await {
                return self.enter_backoff(format!("anchoring checkpoint: {}", e));
            }
        }

        let last = self.checkpoint.last_scanned_height();
        {
            let mut stats = self.stats.write().await;
            stats.chain_head = head;
            stats.last_scanned_height = last;
            stats.anchored = true;
        }

        if safe_head <= last {
            debug!(head, safe_head, last_scanned_height = last, "No new safe blocks");
            return WatcherState::Idle;
        }

        let to = safe_head.min(last.saturating_add(self.settings.max_batch_size));
        let from = last
            .saturating_add(1)
            .saturating_sub(self.settings.reorg_rescan_blocks)
            .max(1);
        let range = ScanRange::new(from, to);

        debug!(head, safe_head, range = %range, "Scanning new blocks");
        WatcherState::Scanning { range }
    }

    async fn scan(&mut self, range: ScanRange) -> WatcherState {
        let call = self
            .reader
            .get_events(range.from, range.to, &self.settings.event_signature);

        let results = match timeout(self.settings.rpc_timeout, call).await {
            Ok(Ok(results)) => results,
            Ok(Err(ChainReadError::RangeTooLarge { reason, .. })) => {
                if range.span() <= 1 {
                    return self.enter_backoff(format!(
                        "single block {} refused as too large: {}",
                        range.from, reason
                    ));
                }
                // The rescan overlap is dropped so the shrunk range always
                // reaches past the cursor
                let fresh_from = self
                    .checkpoint
                    .last_scanned_height()
                    .saturating_add(1)
                    .clamp(range.from, range.to);
                let shrunk = ScanRange::new(fresh_from, range.to).truncate(range.span() / 2);
                self.metrics.range_shrinks_total.inc();
                info!(range = %range, retry = %shrunk, reason = %reason, "Range too large, halving");
                return WatcherState::Scanning { range: shrunk };
            }
            Ok(Err(e)) => return self.enter_backoff(format!("get_events {}: {}", range, e)),
            Err(_) => {
                return self.enter_backoff(format!(
                    "get_events {} timed out after {:?}",
                    range, self.settings.rpc_timeout
                ))
            }
        };

        let mut events = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(event) => events.push(event),
                Err(e) => {
                    self.metrics.undecodable_logs_total.inc();
                    warn!(
                        tx_hash = ?e.tx_hash,
                        log_index = ?e.log_index,
                        block_number = ?e.block_number,
                        reason = %e.reason,
                        "Skipping undecodable log"
                    );
                }
            }
        }
        events.sort_by_key(|e| e.position());
        self.metrics.events_observed_total.inc_by(events.len() as u64);

        debug!(range = %range, count = events.len(), "Events fetched");
        WatcherState::Draining { range, events }
    }

    async fn drain(&mut self, range: ScanRange, events: Vec<BridgeEvent>) -> WatcherState {
        let mut seen = HashSet::new();
        let mut pending = Vec::with_capacity(events.len());
        for event in events {
            let key = event.key();
            if self.checkpoint.is_processed(&key) || !seen.insert(key) {
                self.metrics.duplicates_skipped_total.inc();
                debug!(
                    tx_hash = %event.source_tx_hash,
                    log_index = event.log_index,
                    block_number = event.block_number,
                    "Skipping already processed event"
                );
                continue;
            }
            pending.push(event);
        }

        let group_size = self.settings.max_concurrent_events.max(1);
        let mut first_unresolved: Option<u64> = None;
        let mut persist_failure: Option<String> = None;

        for group in pending.chunks(group_size) {
            let dispositions = join_all(group.iter().map(|event| self.handle_event(event))).await;

            for (event, disposition) in group.iter().zip(dispositions) {
                self.record_disposition(event, &disposition).await;

                if disposition.is_final() {
                    if let Err(e) = self
                        .checkpoint
                        .mark_processed(event.key(), event.block_number)
                        .await
                    {
                        error!(
                            tx_hash = %event.source_tx_hash,
                            log_index = event.log_index,
                            block_number = event.block_number,
                            error = %e,
                            "Failed to persist processed event"
                        );
                        persist_failure.get_or_insert_with(|| e.to_string());
                    }
                } else {
                    first_unresolved = Some(
                        first_unresolved.map_or(event.block_number, |b| b.min(event.block_number)),
                    );
                }
            }

            if first_unresolved.is_some() || persist_failure.is_some() {
                break;
            }
        }

        self.stats.write().await.processed_keys = self.checkpoint.processed_len();

        if let Some(cause) = persist_failure {
            return self.enter_backoff(format!("checkpoint write failed: {}", cause));
        }

        WatcherState::Committing {
            range,
            first_unresolved,
        }
    }

    /// Validate then, if approved, dispatch. Never touches the checkpoint.
    async fn handle_event(&self, event: &BridgeEvent) -> EventDisposition {
        let outcome = match timeout(
            self.settings.validation_timeout,
            self.validator.validate(event),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => ValidationOutcome::Indeterminate(format!(
                "validation timed out after {:?}",
                self.settings.validation_timeout
            )),
        };

        match outcome {
            ValidationOutcome::Approved => {}
            ValidationOutcome::Rejected(reason) => return EventDisposition::Rejected(reason),
            ValidationOutcome::Indeterminate(cause) => {
                return EventDisposition::Indeterminate(cause)
            }
        }

        match timeout(self.settings.dispatch_timeout, self.dispatcher.dispatch(event)).await {
            Ok(ActionOutcome::Submitted(receipt)) => EventDisposition::Dispatched(receipt),
            Ok(ActionOutcome::Failed {
                cause,
                retryable: true,
            }) => EventDisposition::RetryableFailure(cause),
            Ok(ActionOutcome::Failed {
                cause,
                retryable: false,
            }) => EventDisposition::PoisonPill(cause),
            Err(_) => EventDisposition::RetryableFailure(format!(
                "dispatch timed out after {:?}",
                self.settings.dispatch_timeout
            )),
        }
    }

    async fn record_disposition(&self, event: &BridgeEvent, disposition: &EventDisposition) {
        let mut stats = self.stats.write().await;
        match disposition {
            EventDisposition::Dispatched(receipt) => {
                self.metrics.events_dispatched_total.inc();
                stats.events_dispatched += 1;
                info!(
                    tx_hash = %event.source_tx_hash,
                    log_index = event.log_index,
                    block_number = event.block_number,
                    amount = %event.amount,
                    dest_tx = %receipt.tx_id,
                    simulated = receipt.simulated,
                    "Event dispatched"
                );
            }
            EventDisposition::Rejected(reason) => {
                self.metrics.events_rejected_total.inc();
                stats.events_rejected += 1;
                warn!(
                    tx_hash = %event.source_tx_hash,
                    log_index = event.log_index,
                    block_number = event.block_number,
                    reason = %reason,
                    "Event rejected by validator"
                );
            }
            EventDisposition::PoisonPill(cause) => {
                self.metrics.dispatch_failures_poison_total.inc();
                error!(
                    tx_hash = %event.source_tx_hash,
                    log_index = event.log_index,
                    block_number = event.block_number,
                    cause = %cause,
                    "Dispatch failed permanently, event will not be retried"
                );
            }
            EventDisposition::Indeterminate(cause) => {
                self.metrics.events_indeterminate_total.inc();
                stats.events_unresolved += 1;
                warn!(
                    tx_hash = %event.source_tx_hash,
                    log_index = event.log_index,
                    block_number = event.block_number,
                    cause = %cause,
                    "Validation indeterminate, event will be retried"
                );
            }
            EventDisposition::RetryableFailure(cause) => {
                self.metrics.dispatch_failures_retryable_total.inc();
                stats.events_unresolved += 1;
                warn!(
                    tx_hash = %event.source_tx_hash,
                    log_index = event.log_index,
                    block_number = event.block_number,
                    cause = %cause,
                    "Dispatch failed, event will be retried"
                );
            }
        }
    }

    async fn commit(&mut self, range: ScanRange, first_unresolved: Option<u64>) -> WatcherState {
        let current = self.checkpoint.last_scanned_height();

        let Some(block) = first_unresolved else {
            // Ranges that only re-read the rescan overlap end below the cursor
            if range.to > current {
                if let Err(e) = self.checkpoint.commit(range.to).await {
                    return self.enter_backoff(format!("commit {}: {}", range.to, e));
                }
            }
            if let Err(e) = self.checkpoint.evict_older_than(range.to).await {
                return self.enter_backoff(format!("evicting dedup window: {}", e));
            }
            self.backoff.reset();
            self.publish_progress().await;
            debug!(range = %range, "Range fully processed");
            return WatcherState::Polling;
        };

        let target = block.saturating_sub(1);
        if target > current {
            if let Err(e) = self.checkpoint.commit(target).await {
                return self.enter_backoff(format!("partial commit {}: {}", target, e));
            }
            info!(
                range = %range,
                committed = target,
                first_unresolved = block,
                "Partially committed range"
            );
        }
        self.publish_progress().await;
        self.enter_backoff(format!("unresolved events from block {}", block))
    }

    async fn publish_progress(&self) {
        let mut stats = self.stats.write().await;
        stats.last_scanned_height = self.checkpoint.last_scanned_height();
        stats.processed_keys = self.checkpoint.processed_len();
        self.metrics
            .last_scanned_height
            .set(stats.last_scanned_height as i64);
        self.metrics.processed_keys.set(stats.processed_keys as i64);
    }
}
