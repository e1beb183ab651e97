//! Prometheus metrics exposition
//!
//! - `proxy_requests_total` (counter): labels `route`, `status`
//! - `proxy_request_duration_seconds` (histogram): label `route`
//! - `proxy_upstream_errors_total` (counter): label `error_type`
//! - `key_usage_weight_total` (counter): label `kind`
//! - `poll_iterations_total` (counter)
//!
//! `key_pool_allocations_total` and `key_pool_size` are recorded by the pool
//! itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram boundaries in seconds. Synchronous queries can legitimately
/// wait minutes, hence the long tail.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
    600.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("proxy_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
///
/// `proxy_request_duration_seconds` is configured with explicit buckets so it
/// renders as a histogram (with `_bucket` lines) rather than a summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed request on one of the task routes.
pub fn record_request(route: &'static str, status: u16, duration_secs: f64) {
    metrics::counter!("proxy_requests_total", "route" => route, "status" => status.to_string())
        .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "route" => route).record(duration_secs);
}

/// Record an upstream failure: `transport`, `timeout` or `parse`.
pub fn record_upstream_error(error_type: &'static str) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => error_type).increment(1);
}

/// Record usage weight charged for a successful submission.
pub fn record_usage(kind: &'static str, weight: u64) {
    metrics::counter!("key_usage_weight_total", "kind" => kind).increment(weight);
}

pub fn record_poll_iteration() {
    metrics::counter!("poll_iterations_total").increment(1);
}

/// Process-local counters reported by `/health` and at shutdown.
#[derive(Clone)]
pub struct ServiceCounters {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Requests currently being handled; reported if the drain deadline hits.
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceCounters {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    /// Mark a request as started; the guard decrements `in_flight` on drop,
    /// including when the client disconnects and the handler is dropped.
    pub fn begin(&self) -> InFlightGuard {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: self.in_flight.clone(),
        }
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for ServiceCounters {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
