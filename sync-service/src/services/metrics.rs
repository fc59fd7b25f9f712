//! Prometheus metrics for sync-service.
//!
//! Recorded through the `metrics` facade; the exporter handle renders the
//! text exposition for `/metrics`.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

/// Global handle to the Prometheus recorder.
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Later calls are no-ops, so several
/// applications can be built in one test process.
pub fn init_metrics() {
    METRICS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    });
}

/// Current metrics in Prometheus text format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized".to_string())
}

/// Record a sync run reaching `status`.
pub fn record_sync_run(source: &str, status: &str) {
    counter!("sync_runs_total", "source" => source.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record records handled by the upsert writer, by outcome.
pub fn record_sync_records(source: &str, outcome: &'static str, count: u64) {
    if count > 0 {
        counter!("sync_records_total", "source" => source.to_string(), "outcome" => outcome)
            .increment(count);
    }
}

/// Record one retried payment API call.
pub fn record_fetch_retry(source: &str) {
    counter!("sync_fetch_retries_total", "source" => source.to_string()).increment(1);
}

/// Record CSV rows by pipeline stage and outcome.
pub fn record_import_rows(stage: &'static str, outcome: &'static str, count: u64) {
    if count > 0 {
        counter!("import_rows_total", "stage" => stage, "outcome" => outcome).increment(count);
    }
}

/// Record the duration of a store operation started at `started`.
pub fn record_store_query(operation: &'static str, started: Instant) {
    histogram!("store_query_duration_seconds", "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!("errors_total", "error_type" => error_type.to_string()).increment(1);
}
