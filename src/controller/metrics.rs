//! Prometheus metrics for the node-detacher controller
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `node_detacher_reconcile_duration_seconds` (histogram): reconcile duration.
//! - `node_detacher_reconcile_errors_total` (counter): reconcile errors labeled by kind.
//! - `node_detacher_target_operations_total` (counter): registry calls labeled by operation, target kind and result.
//! - `node_detacher_state_transitions_total` (counter): classified node states acted upon.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for reconcile error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Error category, see `Error::kind`
    pub kind: String,
}

/// Labels for registry call metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TargetOperationLabels {
    /// "register" or "deregister"
    pub operation: String,
    pub target_kind: String,
    /// "success" or "failed"
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StateLabels {
    pub state: String,
}

pub static RECONCILE_DURATION_SECONDS: Lazy<Histogram> =
    Lazy::new(|| Histogram::new(exponential_buckets(0.001, 2.0, 16)));

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static TARGET_OPERATIONS_TOTAL: Lazy<Family<TargetOperationLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static STATE_TRANSITIONS_TOTAL: Lazy<Family<StateLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    // counters get their `_total` suffix from the encoder
    registry.register(
        "node_detacher_reconcile_duration_seconds",
        "Duration of node reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "node_detacher_reconcile_errors",
        "Total number of node reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "node_detacher_target_operations",
        "Total number of register and deregister calls against external targets",
        TARGET_OPERATIONS_TOTAL.clone(),
    );
    registry.register(
        "node_detacher_state_transitions",
        "Total number of node state transitions acted upon",
        STATE_TRANSITIONS_TOTAL.clone(),
    );

    registry
});

pub fn observe_reconcile_duration(seconds: f64) {
    RECONCILE_DURATION_SECONDS.observe(seconds);
}

pub fn inc_reconcile_error(kind: &str) {
    RECONCILE_ERRORS_TOTAL
        .get_or_create(&ErrorLabels {
            kind: kind.to_string(),
        })
        .inc();
}

pub fn inc_target_operation(operation: &str, target_kind: &str, success: bool) {
    let labels = TargetOperationLabels {
        operation: operation.to_string(),
        target_kind: target_kind.to_string(),
        result: if success { "success" } else { "failed" }.to_string(),
    };
    TARGET_OPERATIONS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_state_transition(state: &str) {
    STATE_TRANSITIONS_TOTAL
        .get_or_create(&StateLabels {
            state: state.to_string(),
        })
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_registry_encodes_all_families() {
        inc_target_operation("deregister", "target_group", true);
        inc_reconcile_error("registry");
        inc_state_transition("detaching");
        observe_reconcile_duration(0.25);

        let mut buffer = String::new();
        encode(&mut buffer, &REGISTRY).unwrap();

        assert!(buffer.contains("node_detacher_target_operations_total"));
        assert!(buffer.contains("target_kind=\"target_group\""));
        assert!(buffer.contains("node_detacher_reconcile_errors_total"));
        assert!(buffer.contains("node_detacher_state_transitions_total"));
        assert!(buffer.contains("node_detacher_reconcile_duration_seconds"));
    }
}
