//! Prometheus metrics for the watcher

use prometheus::{IntCounter, IntGauge, Registry};

/// Prometheus metrics
pub struct Metrics {
    pub events_observed_total: IntCounter,
    pub events_dispatched_total: IntCounter,
    pub events_rejected_total: IntCounter,
    pub events_indeterminate_total: IntCounter,
    pub dispatch_failures_retryable_total: IntCounter,
    /// Non-retryable dispatch failures, recorded as processed and skipped
    pub dispatch_failures_poison_total: IntCounter,
    pub duplicates_skipped_total: IntCounter,
    pub undecodable_logs_total: IntCounter,
    pub range_shrinks_total: IntCounter,
    pub backoffs_total: IntCounter,
    pub chain_head: IntGauge,
    pub last_scanned_height: IntGauge,
    pub processed_keys: IntGauge,
    pub registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).expect("constant metric name is valid");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric registration must not be called twice");
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::new(name, help).expect("constant metric name is valid");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric registration must not be called twice");
    metric
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        Self {
            events_observed_total: counter(
                &registry,
                "bridge_watcher_events_observed_total",
                "Lock events decoded from source-chain logs",
            ),
            events_dispatched_total: counter(
                &registry,
                "bridge_watcher_events_dispatched_total",
                "Events whose destination action was submitted",
            ),
            events_rejected_total: counter(
                &registry,
                "bridge_watcher_events_rejected_total",
                "Events the validator rejected",
            ),
            events_indeterminate_total: counter(
                &registry,
                "bridge_watcher_events_indeterminate_total",
                "Validation attempts without a trustworthy answer",
            ),
            dispatch_failures_retryable_total: counter(
                &registry,
                "bridge_watcher_dispatch_failures_retryable_total",
                "Dispatch attempts that failed and will be retried",
            ),
            dispatch_failures_poison_total: counter(
                &registry,
                "bridge_watcher_dispatch_failures_poison_total",
                "Events dropped after a non-retryable dispatch failure",
            ),
            duplicates_skipped_total: counter(
                &registry,
                "bridge_watcher_duplicates_skipped_total",
                "Events skipped because they were already processed",
            ),
            undecodable_logs_total: counter(
                &registry,
                "bridge_watcher_undecodable_logs_total",
                "Matching logs that could not be decoded",
            ),
            range_shrinks_total: counter(
                &registry,
                "bridge_watcher_range_shrinks_total",
                "Scan ranges halved after the endpoint refused the span",
            ),
            backoffs_total: counter(
                &registry,
                "bridge_watcher_backoffs_total",
                "Transitions into backoff",
            ),
            chain_head: gauge(
                &registry,
                "bridge_watcher_chain_head",
                "Latest source-chain height observed",
            ),
            last_scanned_height: gauge(
                &registry,
                "bridge_watcher_last_scanned_height",
                "Last committed scan height",
            ),
            processed_keys: gauge(
                &registry,
                "bridge_watcher_processed_keys",
                "Processed event keys held in the dedup window",
            ),
            registry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registered_once() {
        let metrics = Metrics::new();
        metrics.events_observed_total.inc();
        metrics.chain_head.set(42);

        let names: Vec<String> = metrics
            .registry
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"bridge_watcher_events_observed_total".to_string()));
        assert!(names.contains(&"bridge_watcher_chain_head".to_string()));
        assert_eq!(names.len(), 13);
    }
}
