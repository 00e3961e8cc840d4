//! Pending-query cache for DNS over UDP.
//!
//! A single UDP socket multiplexes many in-flight queries, so responses
//! are paired by transaction id plus queried domain instead of by flow
//! state. Entries that never see a response are reaped by the sweeper.

use dashmap::DashMap;

use remora_common::SockEvent;
use remora_protocols::{labels, AttributeMap};

use crate::analyzer::pairs::NANOS_PER_SEC;

/// A parsed query waiting for its response.
#[derive(Clone, Debug)]
pub struct PendingQuery {
    pub event: SockEvent,
    pub attributes: AttributeMap,
}

type QueryKey = (i64, String);

fn query_key(attributes: &AttributeMap) -> QueryKey {
    (
        attributes.get_int(labels::DNS_ID).unwrap_or(0),
        attributes
            .get_str(labels::DNS_DOMAIN)
            .unwrap_or_default()
            .to_string(),
    )
}

/// All pending queries of one UDP flow.
#[derive(Debug, Default)]
pub struct DnsUdpCache {
    queries: DashMap<QueryKey, PendingQuery>,
}

impl DnsUdpCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_request(&self, event: SockEvent, attributes: AttributeMap) {
        self.queries
            .insert(query_key(&attributes), PendingQuery { event, attributes });
    }

    /// Remove and return the query a response answers, matching on id and
    /// domain. Also reports how many queries remain so the caller can
    /// purge an empty flow entry.
    pub fn take_match(&self, response: &AttributeMap) -> (Option<PendingQuery>, usize) {
        let matched = self.queries.remove(&query_key(response)).map(|(_, q)| q);
        (matched, self.queries.len())
    }

    /// Remove and return every query older than `threshold_secs`.
    pub fn take_expired(&self, now_secs: u64, threshold_secs: u64) -> Vec<PendingQuery> {
        let expired_keys: Vec<QueryKey> = self
            .queries
            .iter()
            .filter(|entry| {
                now_secs.saturating_sub(entry.value().event.timestamp / NANOS_PER_SEC)
                    >= threshold_secs
            })
            .map(|entry| entry.key().clone())
            .collect();

        expired_keys
            .into_iter()
            .filter_map(|key| self.queries.remove(&key).map(|(_, q)| q))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}
