//! # Metrics
//!
//! Prometheus registry and the collectors the reconcilers update.

use anyhow::Result;
use prometheus::{Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::collections::{BTreeSet, HashMap};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

/// Global Prometheus metrics registry
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static MACHINE_DEPLOYMENT_INFO: LazyLock<GaugeVec> = LazyLock::new(|| {
    GaugeVec::new(
        Opts::new(
            "machine_deployment_node_group_info",
            "MachineDeployments observed for a NodeGroup; 0 once no longer observed",
        ),
        &["node_group", "name"],
    )
    .expect("Failed to create MACHINE_DEPLOYMENT_INFO metric - this should never happen")
});

static NODE_STATUS: LazyLock<GaugeVec> = LazyLock::new(|| {
    GaugeVec::new(
        Opts::new("node_group_node_status", "Update state of a node, one-hot over the status label"),
        &["node", "node_group", "status"],
    )
    .expect("Failed to create NODE_STATUS metric - this should never happen")
});

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("node_manager_reconciliations_total", "Total number of reconciliations"),
        &["controller"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("node_manager_reconciliation_errors_total", "Total number of reconciliation errors"),
        &["controller", "kind"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "node_manager_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["controller"],
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

/// MachineDeployments last seen per NodeGroup, for sweeping stale series.
static SEEN_MACHINE_DEPLOYMENTS: LazyLock<Mutex<HashMap<String, BTreeSet<String>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Statuses reported by `node_group_node_status`.
pub const NODE_STATUSES: [&str; 11] = [
    "WaitingForApproval",
    "Approved",
    "DrainingForDisruption",
    "Draining",
    "Drained",
    "WaitingForDisruptionApproval",
    "WaitingForManualDisruptionApproval",
    "DisruptionApproved",
    "ToBeUpdated",
    "UpToDate",
    "UpdateFailedNoConfigChecksum",
];

/// Register all metrics with the Prometheus registry
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(MACHINE_DEPLOYMENT_INFO.clone()))?;
    REGISTRY.register(Box::new(NODE_STATUS.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    Ok(())
}

/// Renders the registry in the Prometheus text format.
pub fn gather() -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Sets the info gauge for the MachineDeployments seen this cycle and zeroes
/// the ones seen in an earlier cycle but absent now.
pub fn observe_machine_deployments(node_group: &str, names: &BTreeSet<String>) {
    let mut seen = SEEN_MACHINE_DEPLOYMENTS.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let previous = seen.insert(node_group.to_string(), names.clone()).unwrap_or_default();
    for name in names {
        MACHINE_DEPLOYMENT_INFO.with_label_values(&[node_group, name.as_str()]).set(1.0);
    }
    for stale in previous.difference(names) {
        MACHINE_DEPLOYMENT_INFO.with_label_values(&[node_group, stale.as_str()]).set(0.0);
    }
}

/// Zeroes every info series of a deleted NodeGroup and stops tracking it.
pub fn forget_node_group(node_group: &str) {
    let mut seen = SEEN_MACHINE_DEPLOYMENTS.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    for stale in seen.remove(node_group).unwrap_or_default() {
        MACHINE_DEPLOYMENT_INFO.with_label_values(&[node_group, stale.as_str()]).set(0.0);
    }
}

/// Whether `node_group` still has tracked MachineDeployments.
pub fn tracks_node_group(node_group: &str) -> bool {
    SEEN_MACHINE_DEPLOYMENTS
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .contains_key(node_group)
}

/// Current value of the info gauge, for tests and debugging.
pub fn machine_deployment_info(node_group: &str, name: &str) -> f64 {
    MACHINE_DEPLOYMENT_INFO.with_label_values(&[node_group, name]).get()
}

/// Marks `status` as the single active status of `node`.
pub fn set_node_status(node_group: &str, node: &str, status: &str) {
    for candidate in NODE_STATUSES {
        let value = if candidate == status { 1.0 } else { 0.0 };
        NODE_STATUS.with_label_values(&[node, node_group, candidate]).set(value);
    }
}

/// Current value of the node status gauge, for tests and debugging.
pub fn node_status(node_group: &str, node: &str, status: &str) -> f64 {
    NODE_STATUS.with_label_values(&[node, node_group, status]).get()
}

/// Records one finished reconcile.
pub fn record_reconcile(controller: &str, elapsed: Duration, error_kind: Option<&str>) {
    RECONCILIATIONS_TOTAL.with_label_values(&[controller]).inc();
    RECONCILIATION_DURATION.with_label_values(&[controller]).observe(elapsed.as_secs_f64());
    if let Some(kind) = error_kind {
        RECONCILIATION_ERRORS_TOTAL.with_label_values(&[controller, kind]).inc();
    }
}
