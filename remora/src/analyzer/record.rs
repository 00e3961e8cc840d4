//! The output record and its free-list pool.

use std::sync::Mutex;

use serde::Serialize;

use remora_protocols::AttributeMap;

/// Latency decomposition and byte accounting of one transaction, all in
/// nanoseconds / bytes.
#[derive(Clone, Debug, Default, Serialize)]
pub struct TransactionMetrics {
    pub connect_time: u64,
    pub request_sent_time: u64,
    pub waiting_ttfb_time: u64,
    pub content_download_time: u64,
    pub request_total_time: u64,
    pub request_io: u64,
    pub response_io: u64,
}

/// One reconstructed transaction, ready for consumer fan-out.
///
/// `timestamp` is the start of the transaction (request or connect entry),
/// in nanoseconds.
#[derive(Clone, Debug, Default, Serialize)]
pub struct TransactionRecord {
    pub labels: AttributeMap,
    pub metrics: TransactionMetrics,
    pub timestamp: u64,
}

impl TransactionRecord {
    fn reset(&mut self) {
        self.labels.clear();
        self.metrics = TransactionMetrics::default();
        self.timestamp = 0;
    }
}

/// Free list bounding record allocation under sustained load. Records are
/// handed back after the consumers are done with them.
#[derive(Debug, Default)]
pub struct RecordPool {
    free: Mutex<Vec<TransactionRecord>>,
}

impl RecordPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> TransactionRecord {
        self.free
            .lock()
            .expect("record pool lock poisoned")
            .pop()
            .unwrap_or_default()
    }

    pub fn free(&self, mut record: TransactionRecord) {
        record.reset();
        self.free
            .lock()
            .expect("record pool lock poisoned")
            .push(record);
    }
}
