//! Instruments recorded by the worker loop.
use std::time::Duration;

use opentelemetry::{
    metrics::{Counter, Histogram, Meter, UpDownCounter},
    KeyValue,
};

/// Meters for the controller's work loop.
///
/// All instruments are recorded in the worker, not the reconciler, so they
/// fire even when a reconcile is aborted.
pub struct MetricsReporter {
    work_queue_depth: UpDownCounter<i64>,
    reconcile_count: Counter<u64>,
    reconcile_latency: Histogram<u64>,
}

impl MetricsReporter {
    /// Register the controller instruments on the meter.
    pub fn new(meter: Meter) -> Self {
        let work_queue_depth = meter
            .i64_up_down_counter("kangal_work_queue_depth")
            .with_description("Depth of the work queue")
            .init();
        let reconcile_count = meter
            .u64_counter("kangal_reconcile_count")
            .with_description("Number of reconcile operations")
            .init();
        let reconcile_latency = meter
            .u64_histogram("kangal_reconcile_latency")
            .with_description("Latency of reconcile operations")
            .with_unit(opentelemetry::metrics::Unit::new("ms"))
            .init();
        Self {
            work_queue_depth,
            reconcile_count,
            reconcile_latency,
        }
    }

    /// Record the work queue depth observed on a get.
    pub fn observe_queue_depth(&self, depth: usize) {
        self.work_queue_depth.add(depth as i64, &[]);
    }

    /// Record one reconcile attempt with its outcome and latency.
    pub fn observe_reconcile(&self, key: &str, success: bool, latency: Duration) {
        let attributes = [
            KeyValue::new("key", key.to_owned()),
            KeyValue::new("success", if success { "true" } else { "false" }),
        ];
        self.reconcile_count.add(1, &attributes);
        self.reconcile_latency
            .record(latency.as_millis() as u64, &attributes);
    }
}
