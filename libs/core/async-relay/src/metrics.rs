//! Prometheus metrics for the relay
//!
//! Recording is always safe: without an installed recorder the macros are no-ops,
//! so tests never need to call [`init_metrics`].

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call once at startup. Later calls are no-ops. If another recorder is already
/// installed the error is logged and `/metrics` stays empty.
pub fn init_metrics() {
    if PROMETHEUS_HANDLE.get().is_some() {
        return;
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_ok() {
                info!("Prometheus metrics initialized");
            }
        }
        Err(e) => warn!(error = %e, "Failed to install Prometheus recorder"),
    }
}

pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> Option<String> {
    prometheus_handle().map(|h| h.render())
}

/// Metric names and label conventions in one place
pub struct RelayMetrics;

impl RelayMetrics {
    pub fn request_published(operation: &str) {
        counter!(
            "relay_requests_published_total",
            "operation" => operation.to_string()
        )
        .increment(1);
    }

    pub fn publish_failed(operation: &str) {
        counter!(
            "relay_publish_failures_total",
            "operation" => operation.to_string()
        )
        .increment(1);
    }

    /// A connection-class failure is about to be retried
    pub fn retry(component: &str, operation: &str) {
        counter!(
            "relay_retries_total",
            "component" => component.to_string(),
            "operation" => operation.to_string()
        )
        .increment(1);
    }

    pub fn result_stored(status: &'static str) {
        counter!("relay_results_stored_total", "status" => status).increment(1);
    }

    /// A results-stream message was acknowledged without a store write
    pub fn result_skipped(reason: &'static str) {
        counter!("relay_results_skipped_total", "reason" => reason).increment(1);
    }

    pub fn wait_finished(outcome: &'static str, elapsed: Duration) {
        counter!("relay_waits_total", "outcome" => outcome).increment(1);
        histogram!("relay_wait_duration_seconds", "outcome" => outcome)
            .record(elapsed.as_secs_f64());
    }

    pub fn waits_in_flight(count: usize) {
        gauge!("relay_waits_in_flight").set(count as f64);
    }

    pub fn lock_outcome(lock_key: &str, outcome: &'static str) {
        counter!(
            "relay_lock_attempts_total",
            "lock" => lock_key.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    pub fn circuit_transition(name: &str, state: &'static str) {
        counter!(
            "relay_circuit_breaker_transitions_total",
            "name" => name.to_string(),
            "state" => state
        )
        .increment(1);
    }

    pub fn dependency_up(dependency: &str, up: bool) {
        gauge!(
            "relay_dependency_up",
            "dependency" => dependency.to_string()
        )
        .set(if up { 1.0 } else { 0.0 });
    }
}
