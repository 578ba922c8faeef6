//! Prometheus metrics for the load balancer reconciler
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `lb_reconcile_duration_seconds` (histogram): duration of each produced operation.
//! - `lb_reconcile_errors_total` (counter): failed operations labeled by operation and error kind.
//! - `lb_cloud_writes_total` (counter): accepted cloud mutations labeled by resource and operation.
//! - `lb_route_batch_size` (histogram): route operations applied per route table write.
//! - `lb_multi_slb_active_nodes` (gauge): nodes placed on each multi-SLB configuration.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operation metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    /// e.g. "ensure_load_balancer"
    pub operation: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub operation: String,
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CloudWriteLabels {
    pub resource: String,
    pub operation: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LoadBalancerLabels {
    pub load_balancer: String,
}

/// Histogram tracking operation duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<OperationLabels, Histogram>> =
    Lazy::new(|| {
        fn reconcile_histogram() -> Histogram {
            // 1ms .. ~32s across 16 buckets.
            Histogram::new(exponential_buckets(0.001, 2.0, 16))
        }

        Family::new_with_constructor(reconcile_histogram)
    });

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static CLOUD_WRITES_TOTAL: Lazy<Family<CloudWriteLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static ROUTE_BATCH_SIZE: Lazy<Histogram> =
    Lazy::new(|| Histogram::new(exponential_buckets(1.0, 2.0, 10)));

pub static MULTI_SLB_ACTIVE_NODES: Lazy<Family<LoadBalancerLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "lb_reconcile_duration_seconds",
        "Duration of load balancer operations in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "lb_reconcile_errors_total",
        "Total number of failed load balancer operations",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "lb_cloud_writes_total",
        "Total number of accepted cloud resource mutations",
        CLOUD_WRITES_TOTAL.clone(),
    );
    registry.register(
        "lb_route_batch_size",
        "Route operations applied per route table write",
        ROUTE_BATCH_SIZE.clone(),
    );
    registry.register(
        "lb_multi_slb_active_nodes",
        "Nodes placed on each multiple standard load balancer configuration",
        MULTI_SLB_ACTIVE_NODES.clone(),
    );

    registry
});

pub fn observe_reconcile_duration_seconds(operation: &str, seconds: f64) {
    let labels = OperationLabels {
        operation: operation.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

pub fn inc_reconcile_error(operation: &str, kind: &str) {
    let labels = ErrorLabels {
        operation: operation.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_cloud_write(resource: &str, operation: &str) {
    let labels = CloudWriteLabels {
        resource: resource.to_string(),
        operation: operation.to_string(),
    };
    CLOUD_WRITES_TOTAL.get_or_create(&labels).inc();
}

pub fn observe_route_batch_size(size: usize) {
    ROUTE_BATCH_SIZE.observe(size as f64);
}

pub fn set_multi_slb_active_nodes(load_balancer: &str, count: usize) {
    let labels = LoadBalancerLabels {
        load_balancer: load_balancer.to_string(),
    };
    MULTI_SLB_ACTIVE_NODES
        .get_or_create(&labels)
        .set(count as i64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn registry_encodes_recorded_values() {
        inc_cloud_write("load_balancer", "create_or_update");
        inc_reconcile_error("ensure_load_balancer", "validation");
        set_multi_slb_active_nodes("kubernetes", 3);
        observe_route_batch_size(4);

        let mut out = String::new();
        encode(&mut out, &REGISTRY).unwrap();
        assert!(out.contains("lb_cloud_writes_total"));
        assert!(out.contains("resource=\"load_balancer\""));
        assert!(out.contains("lb_multi_slb_active_nodes{load_balancer=\"kubernetes\"} 3"));
    }
}
