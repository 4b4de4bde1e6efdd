//! Prometheus metrics for the CSI driver
//!
//! Provides metrics for monitoring CSI operations, backend calls, and the
//! volume identity registry.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total number of CSI operations by type and status
    pub const CSI_OPERATIONS_TOTAL: &str = "csi_operations_total";
    /// Histogram: Duration of CSI operations in seconds
    pub const CSI_OPERATION_DURATION_SECONDS: &str = "csi_operation_duration_seconds";
    /// Counter: Backend calls by primitive and outcome
    pub const CSI_BACKEND_CALLS_TOTAL: &str = "csi_backend_calls_total";
    /// Counter: Number of retried backend calls
    pub const CSI_BACKEND_RETRIES_TOTAL: &str = "csi_backend_retries_total";
    /// Gauge: Records held by the volume identity registry
    pub const CSI_REGISTRY_RECORDS: &str = "csi_registry_records";
    /// Counter: Backend delete failures reported to the orchestrator as success
    pub const CSI_DELETE_FAILURES_SWALLOWED_TOTAL: &str = "csi_delete_failures_swallowed_total";
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

/// Record a CSI operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::CSI_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::CSI_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record the outcome of one backend call
pub fn record_backend_call(call: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!(names::CSI_BACKEND_CALLS_TOTAL, "call" => call.to_string(), "status" => status)
        .increment(1);
}

/// Record a retry attempt
pub fn record_retry(call: &str) {
    counter!(names::CSI_BACKEND_RETRIES_TOTAL, "call" => call.to_string()).increment(1);
}

/// Track the registry size
pub fn set_registry_records(count: usize) {
    gauge!(names::CSI_REGISTRY_RECORDS).set(count as f64);
}

/// Record a delete failure that was not surfaced to the caller
pub fn record_swallowed_delete_failure() {
    counter!(names::CSI_DELETE_FAILURES_SWALLOWED_TOTAL).increment(1);
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
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, error_code, duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_timer() {
        let timer = OperationTimer::new("test_operation");
        std::thread::sleep(std::time::Duration::from_millis(10));
        // No recorder installed; recording must be a silent no-op
        timer.failure("internal");
    }
}
