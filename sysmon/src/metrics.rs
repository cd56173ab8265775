//! Prometheus-compatible metrics for sessions, RPC traffic and streams

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder
pub fn install_recorder() -> crate::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| crate::Error::Server(format!("failed to install metrics recorder: {}", e)))
}

pub fn record_session_created(provisioning: &'static str, active: usize) {
    metrics::counter!("sysmon_sessions_created_total", "provisioning" => provisioning)
        .increment(1);
    set_active_sessions(active);
}

pub fn set_active_sessions(active: usize) {
    metrics::gauge!("sysmon_sessions_active").set(active as f64);
}

pub fn record_sessions_expired(count: usize) {
    metrics::counter!("sysmon_sessions_expired_total").increment(count as u64);
}

/// Record one dispatched JSON-RPC message
pub fn record_rpc(method: &str, status: &'static str) {
    metrics::counter!(
        "sysmon_rpc_requests_total",
        "method" => method.to_string(),
        "status" => status,
    )
    .increment(1);
}

pub fn record_outbox_full(dropped: bool) {
    metrics::counter!(
        "sysmon_outbox_full_total",
        "action" => if dropped { "dropped" } else { "rejected" },
    )
    .increment(1);
}

pub fn record_stream_event(replayed: bool) {
    metrics::counter!(
        "sysmon_stream_events_total",
        "source" => if replayed { "replay" } else { "live" },
    )
    .increment(1);
}

pub fn record_stream_opened(kind: &'static str) {
    metrics::gauge!("sysmon_streams_active", "kind" => kind).increment(1.0);
}

pub fn record_stream_closed(kind: &'static str, reason: &'static str) {
    metrics::gauge!("sysmon_streams_active", "kind" => kind).decrement(1.0);
    metrics::counter!("sysmon_streams_closed_total", "kind" => kind, "reason" => reason)
        .increment(1);
}

pub fn record_tool_sample(ok: bool) {
    metrics::counter!(
        "sysmon_tool_samples_total",
        "status" => if ok { "ok" } else { "error" },
    )
    .increment(1);
}
