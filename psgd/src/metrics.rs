//! Prometheus metrics for the gateway.
//!
//! Low-cardinality by construction: labels are the closed action and
//! detection-method vocabularies.

use lazy_static::lazy_static;
use prometheus::{
    Histogram, IntCounter, IntCounterVec, histogram_opts, opts, register_histogram,
    register_int_counter, register_int_counter_vec,
};

lazy_static! {
    /// Decisions by final action and detection method.
    pub static ref DECISIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("psg_decisions_total", "Gateway decisions by action and method"),
        &["action", "method"]
    )
    .expect("register psg_decisions_total");

    /// End-to-end decide latency.
    pub static ref DECISION_LATENCY_SECONDS: Histogram = register_histogram!(histogram_opts!(
        "psg_decision_latency_seconds",
        "End-to-end decide latency",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ))
    .expect("register psg_decision_latency_seconds");

    /// Detector failures/timeouts degraded to no-findings.
    pub static ref DETECTOR_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("psg_detector_errors_total", "Detector errors by kind"),
        &["detector"]
    )
    .expect("register psg_detector_errors_total");

    /// Decision-log writes dropped after the retry.
    pub static ref AUDIT_STORE_DROPS_TOTAL: IntCounter = register_int_counter!(opts!(
        "psg_audit_store_drops_total",
        "Decision records dropped after store write retry"
    ))
    .expect("register psg_audit_store_drops_total");

    /// Shipper queue overflow drops (drop-oldest).
    pub static ref AUDIT_SHIPPER_DROPS_TOTAL: IntCounter = register_int_counter!(opts!(
        "psg_audit_shipper_drops_total",
        "Audit documents dropped by the bounded shipper queue"
    ))
    .expect("register psg_audit_shipper_drops_total");
}

/// Encode all registered metrics in the Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buf = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_encode_after_increment() {
        DECISIONS_TOTAL.with_label_values(&["block", "secret"]).inc();
        DECISION_LATENCY_SECONDS.observe(0.004);
        let encoded = encode_metrics().unwrap();
        assert!(encoded.contains("psg_decisions_total"));
        assert!(encoded.contains("psg_decision_latency_seconds"));
    }
}
