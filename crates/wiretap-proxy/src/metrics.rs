#![allow(dead_code)] // registered for binaries embedding the engine, not all used by lib tests

//! Prometheus metrics for wiretap-proxy.
//!
//! Tracks rule matching, step execution, and pass-through performance so an
//! embedding process can expose a `/metrics` endpoint the way the reference
//! implementation's admin API does.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, Encoder,
    HistogramVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Total number of requests that reached the selector.
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "wiretap_requests_total",
        "Total number of requests processed by the engine",
        &["method", "outcome"] // outcome: matched|fallback
    )
    .unwrap();

    /// Total number of times a rule won selection.
    pub static ref RULES_MATCHED_TOTAL: CounterVec = register_counter_vec!(
        "wiretap_rules_matched_total",
        "Total number of times a rule was selected to handle a request",
        &["rule_id"]
    )
    .unwrap();

    /// Step execution duration in milliseconds.
    pub static ref STEP_DURATION_MS: HistogramVec = register_histogram_vec!(
        "wiretap_step_duration_ms",
        "Histogram of step execution time in milliseconds",
        &["step_kind"],
        vec![0.5, 1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]
    )
    .unwrap();

    /// Pass-through errors by stable error tag.
    pub static ref PASSTHROUGH_ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "wiretap_passthrough_errors_total",
        "Count of pass-through errors by tag",
        &["tag"]
    )
    .unwrap();

    /// Pass-through upstream round-trip latency.
    pub static ref PASSTHROUGH_LATENCY_MS: HistogramVec = register_histogram_vec!(
        "wiretap_passthrough_latency_ms",
        "Histogram of upstream round-trip latency in milliseconds",
        &["scheme"],
        vec![1.0, 5.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]
    )
    .unwrap();

    /// Channel callback RPC round-trip latency.
    pub static ref CHANNEL_RPC_DURATION_MS: HistogramVec = register_histogram_vec!(
        "wiretap_channel_rpc_duration_ms",
        "Histogram of callback RPC round-trip time in milliseconds",
        &["kind"], // kind: matcher|step
        vec![0.5, 1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]
    )
    .unwrap();

    /// Number of rules currently active on the engine.
    pub static ref ACTIVE_RULES: IntGauge = register_int_gauge!(
        "wiretap_active_rules",
        "Number of rules currently registered on the engine"
    )
    .unwrap();
}

/// Render all registered metrics in Prometheus text exposition format.
pub fn render() -> Result<Vec<u8>, prometheus::Error> {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_known_metric() {
        REQUESTS_TOTAL.with_label_values(&["GET", "matched"]).inc();
        let rendered = render().unwrap();
        let text = String::from_utf8(rendered).unwrap();
        assert!(text.contains("wiretap_requests_total"));
    }

    #[test]
    fn test_rules_matched_counter_increments() {
        RULES_MATCHED_TOTAL.with_label_values(&["rule-a"]).inc();
        RULES_MATCHED_TOTAL.with_label_values(&["rule-a"]).inc();
        let value = RULES_MATCHED_TOTAL.with_label_values(&["rule-a"]).get();
        assert!(value >= 2.0);
    }
}
