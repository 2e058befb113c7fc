use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!(
        "tracker_points_recorded_total",
        "Points appended to a series, by metric."
    );
    describe_counter!(
        "tracker_points_rejected_total",
        "Feed values dropped as malformed, by metric."
    );
    describe_counter!(
        "tracker_events_emitted_total",
        "Journal events emitted, by kind."
    );
    describe_counter!(
        "tracker_sync_push_total",
        "Push attempts to the point store, by status."
    );
    describe_counter!(
        "tracker_sync_pull_total",
        "Pull attempts from the point store, by status."
    );
    describe_counter!(
        "tracker_stale_responses_total",
        "Network completions discarded after an identity swap or disconnect."
    );
    describe_gauge!(
        "tracker_points_synced",
        "Cumulative points acknowledged by the point store."
    );
    describe_histogram!(
        "tracker_store_latency_ms",
        "Local store call latency in milliseconds."
    );
}

pub fn install_prometheus(port: u16) -> Result<PrometheusHandle> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    Ok(PrometheusBuilder::new()
        .with_http_listener(addr)
        .install_recorder()?)
}
