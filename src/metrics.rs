//! Prometheus metrics for the dispatch server.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge, Encoder, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref WS_CONNECTED_CLIENTS: IntGauge = register_int_gauge!(
        "binhaul_ws_connected_clients",
        "Currently registered WebSocket clients"
    )
    .unwrap();
    pub static ref WS_FRAMES_SENT: IntCounterVec = register_int_counter_vec!(
        "binhaul_ws_frames_sent_total",
        "Frames delivered to WebSocket clients",
        &["type"]
    )
    .unwrap();
    pub static ref WS_CLIENTS_EVICTED: IntCounterVec = register_int_counter_vec!(
        "binhaul_ws_clients_evicted_total",
        "Clients dropped by the hub",
        &["reason"]
    )
    .unwrap();
    pub static ref LOCATION_SAMPLES: IntCounterVec = register_int_counter_vec!(
        "binhaul_location_samples_total",
        "Inbound GPS samples by filter outcome",
        &["outcome"]
    )
    .unwrap();
    pub static ref SNAP_CACHE_OPS: IntCounterVec = register_int_counter_vec!(
        "binhaul_snap_cache_operations_total",
        "Road-snap cache operations",
        &["op"]
    )
    .unwrap();
    pub static ref SNAP_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "binhaul_snap_requests_total",
        "Road-snap provider calls",
        &["result"]
    )
    .unwrap();
    pub static ref PUSH_DISPATCHES: IntCounterVec = register_int_counter_vec!(
        "binhaul_push_dispatches_total",
        "Push notification dispatch attempts",
        &["result"]
    )
    .unwrap();
}

/// Renders the default registry in the Prometheus text format.
pub fn render() -> String {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_register_and_render() {
        LOCATION_SAMPLES.with_label_values(&["accepted"]).inc();
        SNAP_CACHE_OPS.with_label_values(&["miss"]).inc();
        let text = render();
        assert!(text.contains("binhaul_location_samples_total"));
        assert!(text.contains("binhaul_snap_cache_operations_total"));
    }
}
