//! Prometheus metrics for control-plane client operations
//!
//! Covers clone tasks and transport retries towards the block store and
//! file store control planes.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total client operations by type and status
    pub const NBS_CLIENT_OPERATIONS_TOTAL: &str = "nbs_client_operations_total";
    /// Histogram: Duration of client operations in seconds
    pub const NBS_CLIENT_OPERATION_DURATION_SECONDS: &str =
        "nbs_client_operation_duration_seconds";
    /// Counter: Transport-level retries by operation
    pub const NBS_CLIENT_RETRIES_TOTAL: &str = "nbs_client_retries_total";
    /// Counter: Clone attempts that hit a concurrent writer
    pub const NBS_CLONE_CONFLICTS_TOTAL: &str = "nbs_clone_conflicts_total";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a client operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::NBS_CLIENT_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::NBS_CLIENT_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record a transport retry
pub fn record_retry(operation: &str) {
    counter!(names::NBS_CLIENT_RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Record a clone attempt that was aborted by a concurrent writer
pub fn record_clone_conflict() {
    counter!(names::NBS_CLONE_CONFLICTS_TOTAL).increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, status: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, status, duration);
    }
}
