//! Prometheus metrics for Quiver coordinators.

use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, exponential_buckets,
    HistogramVec, IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;

/// Global metrics registry.
pub struct Metrics {
    // Root coordinator
    pub ddl_requests_total: IntCounterVec,
    pub channel_time_tick: IntGaugeVec,

    // Data coordinator
    pub segments_total: IntCounterVec,
    pub data_nodes: IntGaugeVec,

    // Index coordinator
    pub index_tasks_total: IntCounterVec,

    // Allocators
    pub allocator_leases_total: IntCounterVec,

    // Cross-cutting
    pub session_events_total: IntCounterVec,
    pub worker_rpc_latency: HistogramVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

impl Metrics {
    fn build() -> Result<Metrics, prometheus::Error> {
        Ok(Metrics {
            ddl_requests_total: register_int_counter_vec!(
                "quiver_rootcoord_ddl_requests_total",
                "DDL requests by type and outcome",
                &["type", "status"]
            )?,

            channel_time_tick: register_int_gauge_vec!(
                "quiver_rootcoord_channel_time_tick",
                "Latest time-tick physical millisecond per channel",
                &["channel"]
            )?,

            segments_total: register_int_counter_vec!(
                "quiver_datacoord_segments_total",
                "Segment state transitions",
                &["state"]
            )?,

            data_nodes: register_int_gauge_vec!(
                "quiver_datacoord_data_nodes",
                "Known data nodes by liveness",
                &["status"]
            )?,

            index_tasks_total: register_int_counter_vec!(
                "quiver_indexcoord_tasks_total",
                "Index build task events",
                &["event"]
            )?,

            allocator_leases_total: register_int_counter_vec!(
                "quiver_allocator_leases_total",
                "Batches leased from the meta store",
                &["allocator"]
            )?,

            session_events_total: register_int_counter_vec!(
                "quiver_session_events_total",
                "Session watch events by role and kind",
                &["role", "kind"]
            )?,

            worker_rpc_latency: register_histogram_vec!(
                "quiver_worker_rpc_latency_seconds",
                "Latency of coordinator-to-worker RPCs",
                &["rpc"],
                exponential_buckets(0.001, 2.0, 12)?
            )?,
        })
    }

    /// The process-wide metrics instance, registered on first use.
    pub fn get() -> &'static Metrics {
        METRICS.get_or_init(|| Metrics::build().expect("metrics registration"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_once() {
        let m1 = Metrics::get();
        let m2 = Metrics::get();
        m1.ddl_requests_total.with_label_values(&["create_collection", "total"]).inc();
        assert!(std::ptr::eq(m1, m2));
    }
}
