//! Prometheus metrics.
//!
//! The recorder is installed once per process; later calls reuse the same
//! handle so several routers (tests) can coexist.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::debug;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder and return its render handle.
pub fn install() -> PrometheusHandle {
    HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if metrics::set_global_recorder(recorder).is_err() {
                debug!("A global metrics recorder was already installed");
            }
            handle
        })
        .clone()
}

pub fn record_request(endpoint: &'static str, status: u16) {
    counter!("audiorelay_requests_total", "endpoint" => endpoint, "status" => status.to_string())
        .increment(1);
}

pub fn record_duration(endpoint: &'static str, start: Instant) {
    histogram!("audiorelay_request_duration_seconds", "endpoint" => endpoint)
        .record(start.elapsed().as_secs_f64());
}

/// Resolution cache outcome: `hit`, `miss`, `stale` or `error`
pub fn record_cache(outcome: &'static str) {
    counter!("audiorelay_cache_total", "outcome" => outcome).increment(1);
}

pub fn record_resolver(outcome: &'static str, elapsed: Duration) {
    counter!("audiorelay_resolver_calls_total", "outcome" => outcome).increment(1);
    histogram!("audiorelay_resolver_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_relay_bytes(bytes: usize) {
    counter!("audiorelay_relay_bytes_total").increment(bytes as u64);
}

pub fn record_upstream_error() {
    counter!("audiorelay_upstream_errors_total").increment(1);
}
