//! Metrics side-channel.
//!
//! The worker reports through [`MetricsSink`]; the backend is pluggable.
//! [`PrometheusMetrics`] records into the global `metrics` recorder, which the
//! binary wires to a Prometheus exporter.

use crate::staging::CapacitySnapshot;
use std::net::SocketAddr;
use tracing::info;

/// Metric names
pub const STAGE_DURATION_SECONDS: &str = "pipeline_stage_duration_seconds";
pub const OBJECTS_PROCESSED_TOTAL: &str = "pipeline_objects_processed_total";
pub const OBJECTS_FAILED_TOTAL: &str = "pipeline_objects_failed_total";
pub const STAGING_DISK_USAGE_GB: &str = "pipeline_staging_disk_usage_gb";

/// Receiver for per-object and capacity measurements.
#[cfg_attr(test, mockall::automock)]
pub trait MetricsSink: Send + Sync {
    /// Wall-clock duration of one object attempt.
    fn record_duration(&self, stage: &str, status: &str, seconds: f64);

    fn record_processed(&self, stage: &str, status: &str);

    fn record_failed(&self, stage: &str, reason: &str);

    /// Staging volume usage in GiB.
    fn update_disk_usage(&self, total: f64, used: f64, free: f64);
}

/// Convenience for reporting a full capacity snapshot.
pub fn report_capacity(sink: &dyn MetricsSink, snapshot: &CapacitySnapshot) {
    sink.update_disk_usage(snapshot.total_gb(), snapshot.used_gb(), snapshot.free_gb());
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_duration(&self, _stage: &str, _status: &str, _seconds: f64) {}

    fn record_processed(&self, _stage: &str, _status: &str) {}

    fn record_failed(&self, _stage: &str, _reason: &str) {}

    fn update_disk_usage(&self, _total: f64, _used: f64, _free: f64) {}
}

/// Sink backed by the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusMetrics;

impl PrometheusMetrics {
    /// Install the Prometheus HTTP exporter as the global recorder.
    pub fn install(port: u16) -> anyhow::Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;

        info!(port = port, "Prometheus metrics exporter started");
        Ok(Self)
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_duration(&self, stage: &str, status: &str, seconds: f64) {
        metrics::histogram!(
            STAGE_DURATION_SECONDS,
            "stage" => stage.to_owned(),
            "status" => status.to_owned()
        )
        .record(seconds);
    }

    fn record_processed(&self, stage: &str, status: &str) {
        metrics::counter!(
            OBJECTS_PROCESSED_TOTAL,
            "stage" => stage.to_owned(),
            "status" => status.to_owned()
        )
        .increment(1);
    }

    fn record_failed(&self, stage: &str, reason: &str) {
        metrics::counter!(
            OBJECTS_FAILED_TOTAL,
            "stage" => stage.to_owned(),
            "reason" => reason.to_owned()
        )
        .increment(1);
    }

    fn update_disk_usage(&self, total: f64, used: f64, free: f64) {
        metrics::gauge!(STAGING_DISK_USAGE_GB, "type" => "total").set(total);
        metrics::gauge!(STAGING_DISK_USAGE_GB, "type" => "used").set(used);
        metrics::gauge!(STAGING_DISK_USAGE_GB, "type" => "free").set(free);
    }
}
