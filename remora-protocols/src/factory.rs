//! Parser construction and the learned port→parser cache.
//!
//! The factory owns one instance of every known parser and the per-port
//! cache the analyzer feeds back into. Cached lists are copy-on-write:
//! readers take an `Arc` snapshot and iterate it freely while writers
//! swap in a replacement vector, so a sweep and a cache update can never
//! observe a half-mutated list.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    dns, generic,
    http::{self, UrlClusterMethod},
    ProtocolParser, DNS, HTTP,
};

pub struct ParserFactory {
    parsers: HashMap<&'static str, Arc<ProtocolParser>>,
    generic: Arc<ProtocolParser>,
    udp_dns: Arc<ProtocolParser>,
    port_cache: DashMap<u16, Arc<Vec<Arc<ProtocolParser>>>>,
}

impl ParserFactory {
    pub fn new(cluster_method: UrlClusterMethod) -> Self {
        let mut parsers: HashMap<&'static str, Arc<ProtocolParser>> = HashMap::new();
        parsers.insert(HTTP, Arc::new(http::parser(cluster_method)));
        parsers.insert(DNS, Arc::new(dns::tcp_parser()));

        Self {
            parsers,
            generic: Arc::new(generic::parser()),
            udp_dns: Arc::new(dns::udp_parser()),
            port_cache: DashMap::new(),
        }
    }

    /// Look up a stream parser by protocol name.
    pub fn get_parser(&self, name: &str) -> Option<Arc<ProtocolParser>> {
        self.parsers.get(name).cloned()
    }

    pub fn generic_parser(&self) -> Arc<ProtocolParser> {
        self.generic.clone()
    }

    pub fn udp_dns_parser(&self) -> Arc<ProtocolParser> {
        self.udp_dns.clone()
    }

    /// Snapshot of the parsers learned for `port`, in probe order.
    pub fn cached_parsers(&self, port: u16) -> Option<Arc<Vec<Arc<ProtocolParser>>>> {
        self.port_cache.get(&port).map(|e| e.value().clone())
    }

    /// Record that `parser` reliably matches traffic on `port`.
    pub fn add_cached_parser(&self, port: u16, parser: Arc<ProtocolParser>) {
        let mut entry = self.port_cache.entry(port).or_default();
        if entry.iter().any(|p| Arc::ptr_eq(p, &parser)) {
            return;
        }
        let mut replacement = Vec::with_capacity(entry.len() + 1);
        replacement.extend(entry.iter().cloned());
        replacement.push(parser);
        *entry = Arc::new(replacement);
    }

    /// Drop `parser` from the cache for `port`; empty lists are removed.
    pub fn remove_cached_parser(&self, port: u16, parser: &Arc<ProtocolParser>) {
        if let Some(mut entry) = self.port_cache.get_mut(&port) {
            let replacement: Vec<Arc<ProtocolParser>> = entry
                .iter()
                .filter(|p| !Arc::ptr_eq(p, parser))
                .cloned()
                .collect();
            let now_empty = replacement.is_empty();
            *entry.value_mut() = Arc::new(replacement);
            drop(entry);
            if now_empty {
                self.port_cache.remove_if(&port, |_, v| v.is_empty());
            }
        }
    }
}
