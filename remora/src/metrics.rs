//! Self-metrics helper functions.
//!
//! Thin wrappers over the registry collectors so call sites stay terse.

pub mod registry;

/// Count one emitted transaction record for `protocol`.
pub fn inc_records(protocol: &str) {
    registry::ANALYZER_RECORDS_TOTAL
        .with_label_values(&[protocol])
        .inc();
}

/// Track the number of in-flight message pairs per transport.
///
/// ### Arguments:
///
/// - `transport` - "tcp" or "udp"
/// - `count` - current in-flight pair count
pub fn set_message_pairs(transport: &str, count: i64) {
    registry::ANALYZER_MESSAGE_PAIRS
        .with_label_values(&[transport])
        .set(count);
}
