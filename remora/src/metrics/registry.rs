//! Global metrics registry and collector definitions.

use lazy_static::lazy_static;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry for all remora metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total transaction records emitted, by detected protocol.
    pub static ref ANALYZER_RECORDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("records_total", "Total transaction records emitted to consumers")
            .namespace("remora")
            .subsystem("analyzer"),
        &["protocol"]
    ).expect("failed to create analyzer_records_total metric");

    /// In-flight message pairs held by the analyzer, by transport.
    pub static ref ANALYZER_MESSAGE_PAIRS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("message_pairs", "In-flight message pairs awaiting completion or timeout")
            .namespace("remora")
            .subsystem("analyzer"),
        &["transport"]
    ).expect("failed to create analyzer_message_pairs metric");
}

/// Register every collector with the global registry. Idempotent callers
/// should invoke this once at startup.
pub fn init_registry() {
    let _ = REGISTRY.register(Box::new(ANALYZER_RECORDS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(ANALYZER_MESSAGE_PAIRS.clone()));
}
