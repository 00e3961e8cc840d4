//! The transaction analyzer.
//!
//! Consumes captured socket syscall events from a bounded channel and
//! correlates them into request/response transactions per `(pid, fd)`.
//! Protocol detection runs speculatively: operator-declared ports win,
//! then parsers learned for the port, then a full probe of every enabled
//! parser with the generic catch-all last. A periodic sweep ages out flows
//! whose fd will not be reused and requests that never saw a response.

pub mod dns_cache;
pub mod pairs;
pub mod record;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::{mapref::entry::Entry, DashMap};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use remora_common::{EventCategory, EventError, SockEvent, SyscallKind};
use remora_protocols::{
    factory::ParserFactory, labels, labels::ErrorType, payload_string, set_payload_length,
    AttributeMap, PayloadMessage, ProtocolParser, DNS, NOSUPPORT,
};

use crate::{
    analyzer::{
        dns_cache::DnsUdpCache,
        pairs::{MessagePair, MessagePairs, PairKey, UdpKey, NANOS_PER_SEC},
        record::{RecordPool, TransactionRecord},
    },
    conntrack::Conntracker,
    consumers::Consumer,
    metrics,
    runtime::conf::AnalyzerConf,
};

/// Successful parses on one port before the parser is pinned in the cache.
pub const CACHE_ADD_THRESHOLD: u32 = 50;
/// Cache hits of the no-support parser on one port before it is evicted,
/// giving real parsers another chance.
pub const CACHE_RESET_THRESHOLD: u32 = 5000;

const DEFAULT_SNAPLEN: usize = 1000;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// An event that could not be classified as request or response.
    #[error(transparent)]
    Event(#[from] EventError),

    /// The analyzer loop is gone; no further events can be submitted.
    #[error("event channel closed")]
    ChannelClosed,
}

/// Per-direction payload capture cap, overridable through `SNAPLEN`.
fn snaplen_from_env() -> usize {
    std::env::var("SNAPLEN")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_SNAPLEN)
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn ip_string(ip: Option<IpAddr>) -> String {
    ip.map(|i| i.to_string()).unwrap_or_default()
}

fn hex_string(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct NetworkAnalyzer {
    conf: AnalyzerConf,
    consumers: Vec<Arc<dyn Consumer>>,
    conntracker: Arc<dyn Conntracker>,

    static_port_map: HashMap<u16, String>,
    slow_thresholds: HashMap<String, Duration>,
    protocol_map: HashMap<String, Arc<ProtocolParser>>,
    parsers: Vec<Arc<ProtocolParser>>,
    udp_dns_parser: Arc<ProtocolParser>,
    factory: ParserFactory,

    pool: RecordPool,
    request_monitor: DashMap<PairKey, Arc<MessagePairs>>,
    dns_request_monitor: DashMap<UdpKey, Arc<DnsUdpCache>>,
    tcp_message_pair_size: AtomicI64,
    udp_message_pair_size: AtomicI64,

    snaplen: usize,

    event_tx: mpsc::Sender<SockEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<SockEvent>>>,
    stop_tx: watch::Sender<bool>,
}

impl NetworkAnalyzer {
    pub fn new(
        conf: AnalyzerConf,
        conntracker: Arc<dyn Conntracker>,
        consumers: Vec<Arc<dyn Consumer>>,
    ) -> Self {
        let factory = ParserFactory::new(conf.url_clustering_method);

        let mut static_port_map = HashMap::new();
        let mut slow_thresholds = HashMap::new();
        let mut discern_disabled = HashMap::new();
        for protocol_conf in &conf.protocol_configs {
            for port in &protocol_conf.ports {
                static_port_map.insert(*port, protocol_conf.key.clone());
            }
            set_payload_length(&protocol_conf.key, protocol_conf.payload_length);
            slow_thresholds.insert(protocol_conf.key.clone(), protocol_conf.threshold);
            discern_disabled.insert(protocol_conf.key.clone(), protocol_conf.disable_discern);
        }

        let mut protocol_map = HashMap::new();
        let mut parsers = Vec::new();
        for name in &conf.protocol_parser {
            let Some(parser) = factory.get_parser(name) else {
                warn!("unknown protocol parser '{name}' in configuration, skipping");
                continue;
            };
            protocol_map.insert(name.clone(), parser.clone());
            if !discern_disabled.get(name).copied().unwrap_or(false) {
                parsers.push(parser);
            }
        }
        // the catch-all probes last
        parsers.push(factory.generic_parser());

        let udp_dns_parser = factory.udp_dns_parser();
        let (event_tx, event_rx) = mpsc::channel(conf.event_channel_size.max(1));
        let (stop_tx, _) = watch::channel(false);

        Self {
            conf,
            consumers,
            conntracker,
            static_port_map,
            slow_thresholds,
            protocol_map,
            parsers,
            udp_dns_parser,
            factory,
            pool: RecordPool::new(),
            request_monitor: DashMap::new(),
            dns_request_monitor: DashMap::new(),
            tcp_message_pair_size: AtomicI64::new(0),
            udp_message_pair_size: AtomicI64::new(0),
            snaplen: snaplen_from_env(),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            stop_tx,
        }
    }

    /// Syscall kinds the capture layer should deliver to this analyzer.
    pub fn consumable_events() -> &'static [SyscallKind] {
        &[
            SyscallKind::Read,
            SyscallKind::Write,
            SyscallKind::Readv,
            SyscallKind::Writev,
            SyscallKind::SendTo,
            SyscallKind::RecvFrom,
            SyscallKind::SendMsg,
            SyscallKind::RecvMsg,
            SyscallKind::SendMmsg,
        ]
    }

    /// Spawn the event loop and, when enabled, the timeout sweeper.
    pub fn start(self: &Arc<Self>) {
        let receiver = self
            .event_rx
            .lock()
            .expect("event receiver lock poisoned")
            .take();
        let Some(rx) = receiver else {
            warn!("analyzer already started");
            return;
        };

        let analyzer = self.clone();
        let stop = self.stop_tx.subscribe();
        tokio::spawn(async move { analyzer.run_event_loop(rx, stop).await });

        if self.conf.enable_timeout_check {
            let analyzer = self.clone();
            let stop = self.stop_tx.subscribe();
            tokio::spawn(async move { analyzer.run_sweeper(stop).await });
        }
    }

    /// Stop both tasks. In-flight state is dropped, not flushed.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Submit one captured event. Blocks when the channel is full, pushing
    /// backpressure onto the event source.
    pub async fn consume_event(&self, evt: SockEvent) -> Result<(), AnalyzerError> {
        self.event_tx
            .send(evt)
            .await
            .map_err(|_| AnalyzerError::ChannelClosed)
    }

    async fn run_event_loop(
        &self,
        mut rx: mpsc::Receiver<SockEvent>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe_evt = rx.recv() => match maybe_evt {
                    Some(evt) => {
                        if let Err(e) = self.process_event(evt).await {
                            error!("error happened when processing event: {e}");
                        }
                    }
                    None => return,
                },
                _ = stop.changed() => return,
            }
        }
    }

    async fn run_sweeper(&self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_timeouts(unix_now_secs()).await,
                _ = stop.changed() => return,
            }
        }
    }

    pub(crate) async fn process_event(&self, evt: SockEvent) -> Result<(), AnalyzerError> {
        if evt.category != EventCategory::Net {
            return Ok(());
        }
        if evt.ctx.thread_info.is_none() {
            return Ok(());
        }
        let Some(fd_info) = evt.ctx.fd_info.as_ref() else {
            return Ok(());
        };
        if fd_info.sip.is_empty() {
            return Ok(());
        }

        if evt.is_udp() {
            // of all UDP traffic, only statically mapped DNS is analyzed
            if self.static_port_map.get(&evt.dport).map(String::as_str) != Some(DNS) {
                return Ok(());
            }
            let is_request = evt.is_request()?;
            let udp_key = UdpKey::from_event(&evt);
            if is_request {
                // DNS resolvers batch queries with sendmmsg; each message
                // is its own transaction
                if evt.name == SyscallKind::SendMmsg {
                    for sub_evt in evt.split_sendmmsg() {
                        self.consume_udp_dns_request(sub_evt, udp_key.clone());
                    }
                } else {
                    self.consume_udp_dns_request(evt, udp_key);
                }
            } else {
                self.consume_udp_dns_response(evt, udp_key).await;
            }
            return Ok(());
        }

        if evt.is_connect() {
            return self.analyse_connect(evt).await;
        }

        if evt.data_len == 0 || evt.res_val < 0 {
            return Ok(());
        }

        if evt.is_request()? {
            if evt.name == SyscallKind::SendMmsg {
                for sub_evt in evt.split_sendmmsg() {
                    self.analyse_request(sub_evt).await;
                }
            } else {
                self.analyse_request(evt).await;
            }
        } else {
            self.analyse_response(evt);
        }
        Ok(())
    }

    fn consume_udp_dns_request(&self, evt: SockEvent, key: UdpKey) {
        let mut message = PayloadMessage::request(evt.data.clone());
        if self.udp_dns_parser.parse_request(&mut message) {
            let cache = {
                let entry = self.dns_request_monitor.entry(key).or_default();
                Arc::clone(&entry)
            };
            cache.add_request(evt, message.attributes);
        } else {
            warn!("fail to parse dns request: {}", hex_string(&evt.data));
        }
    }

    async fn consume_udp_dns_response(&self, evt: SockEvent, key: UdpKey) {
        let mut message = PayloadMessage::request(evt.data.clone());
        if !self.udp_dns_parser.parse_response(&mut message) {
            warn!("fail to parse dns response: {}", hex_string(&evt.data));
            return;
        }

        let Some(cache) = self.dns_request_monitor.get(&key).map(|e| e.value().clone()) else {
            return;
        };
        let (matched, remaining) = cache.take_match(&message.attributes);
        if remaining == 0 {
            self.dns_request_monitor.remove_if(&key, |_, c| c.is_empty());
        }
        if let Some(pending) = matched {
            let pair = MessagePair {
                request: pending.event,
                response: Some(evt),
                nat_tuple: None,
            };
            let record = self.record_with_single_pair(&pair, DNS, &message.attributes);
            self.distribute_records(vec![record]).await;
        }
    }

    async fn analyse_connect(&self, evt: SockEvent) -> Result<(), AnalyzerError> {
        let key = PairKey::from_event(&evt);
        let new_pairs = Arc::new(MessagePairs::with_connect(evt.clone(), self.snaplen));

        let existing = match self.request_monitor.entry(key) {
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(new_pairs.clone());
                None
            }
        };

        match existing {
            None => self.record_message_pair_size(&evt, 1),
            Some(old_pairs) => {
                if !old_pairs.has_requests() && old_pairs.has_connects() {
                    if old_pairs.connect_timed_out(&evt, self.conf.connect_timeout) {
                        self.distribute_trace_metric(old_pairs, Some(new_pairs)).await;
                    } else {
                        // connect retry burst, same attempt
                        old_pairs.merge_connect(evt);
                    }
                } else {
                    self.distribute_trace_metric(old_pairs, Some(new_pairs)).await;
                }
            }
        }
        Ok(())
    }

    async fn analyse_request(&self, evt: SockEvent) {
        let key = PairKey::from_event(&evt);
        let new_pairs = Arc::new(MessagePairs::with_request(evt.clone(), self.snaplen));

        let existing = match self.request_monitor.entry(key) {
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(new_pairs.clone());
                None
            }
        };
        let Some(old_pairs) = existing else {
            self.record_message_pair_size(&evt, 1);
            return;
        };

        if !old_pairs.has_requests() {
            if !old_pairs.has_connects() {
                // empty state, start over
                self.request_monitor.insert(key, new_pairs);
            } else {
                // connect phase turning into a request
                old_pairs.merge_request(evt);
            }
            return;
        }

        if old_pairs.has_responses() || old_pairs.request_sport_changed(&evt) {
            self.distribute_trace_metric(old_pairs, Some(new_pairs)).await;
        } else {
            old_pairs.merge_request(evt);
        }
    }

    fn analyse_response(&self, evt: SockEvent) {
        let key = PairKey::from_event(&evt);
        let Some(old_pairs) = self.request_monitor.get(&key).map(|e| e.value().clone()) else {
            return;
        };
        if !old_pairs.has_requests() {
            return;
        }
        old_pairs.merge_response(evt);
    }

    fn record_message_pair_size(&self, evt: &SockEvent, delta: i64) {
        if evt.is_udp() {
            let size = self.udp_message_pair_size.fetch_add(delta, Ordering::AcqRel) + delta;
            metrics::set_message_pairs("udp", size);
        } else {
            let size = self.tcp_message_pair_size.fetch_add(delta, Ordering::AcqRel) + delta;
            metrics::set_message_pairs("tcp", size);
        }
    }

    /// Age out stale state. `now_secs` is wall-clock seconds; the sweeper
    /// ticks this with the current time, tests drive it directly.
    pub(crate) async fn check_timeouts(&self, now_secs: u64) {
        let fd_reuse_secs = self.conf.fd_reuse_timeout.as_secs();
        let no_response_secs = self.conf.no_response_threshold.as_secs();

        let flows: Vec<Arc<MessagePairs>> = self
            .request_monitor
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for pairs in flows {
            let Some(last_ts) = pairs.state().last_event_timestamp() else {
                continue;
            };
            let idle = now_secs.saturating_sub(last_ts / NANOS_PER_SEC);
            if pairs.has_responses() && idle >= fd_reuse_secs {
                // the fd is not coming back; transaction complete
                self.distribute_trace_metric(pairs, None).await;
            } else if idle >= no_response_secs {
                self.distribute_trace_metric(pairs, None).await;
            }
        }

        let dns_flows: Vec<(UdpKey, Arc<DnsUdpCache>)> = self
            .dns_request_monitor
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (key, cache) in dns_flows {
            for pending in cache.take_expired(now_secs, no_response_secs) {
                let pair = MessagePair {
                    request: pending.event,
                    response: None,
                    nat_tuple: None,
                };
                let record = self.record_with_single_pair(&pair, DNS, &pending.attributes);
                self.distribute_records(vec![record]).await;
            }
            if cache.is_empty() {
                self.dns_request_monitor.remove_if(&key, |_, c| c.is_empty());
            }
        }
    }

    /// Flush `old_pairs`: emit its records and either install the state
    /// that displaced it or retire the key.
    async fn distribute_trace_metric(
        &self,
        old_pairs: Arc<MessagePairs>,
        new_pairs: Option<Arc<MessagePairs>>,
    ) {
        let Some(query_evt) = old_pairs.query_event() else {
            return;
        };
        if !old_pairs.check_send() {
            // someone else already emitted this transaction
            return;
        }

        match new_pairs {
            Some(new_pairs) => {
                self.request_monitor.insert(new_pairs.key(), new_pairs);
            }
            None => {
                self.record_message_pair_size(&query_evt, -1);
                self.request_monitor.remove(&old_pairs.key());
            }
        }

        if self.conf.enable_conntrack {
            if let (Some(sip), Some(dip)) = (query_evt.sip(), query_evt.dip()) {
                let nat = self.conntracker.get_dnat_tuple(
                    sip,
                    dip,
                    query_evt.sport,
                    query_evt.dport,
                    query_evt.is_udp(),
                );
                if nat.is_some() {
                    old_pairs.set_nat_tuple(nat);
                }
            }
        }

        let records = self.parse_protocols(&old_pairs);
        self.distribute_records(records).await;
    }

    async fn distribute_records(&self, records: Vec<TransactionRecord>) {
        for record in records {
            debug!("analyzer record to consumers: {:?}", record.labels);
            let protocol = record
                .labels
                .get_str(labels::PROTOCOL)
                .unwrap_or(NOSUPPORT);
            metrics::inc_records(protocol);
            for consumer in &self.consumers {
                consumer.consume(&record).await;
            }
            self.pool.free(record);
        }
    }

    fn parse_protocols(&self, pairs: &Arc<MessagePairs>) -> Vec<TransactionRecord> {
        let port = pairs.query_event().map_or(0, |e| e.dport);

        // operator-declared ports bypass discovery entirely
        if let Some(static_protocol) = self.static_port_map.get(&port) {
            if !pairs.has_requests() {
                return self.connect_fail_records(pairs);
            }
            if let Some(parser) = self.protocol_map.get(static_protocol) {
                if let Some(records) = self.parse_protocol(pairs, parser) {
                    return records;
                }
            }
            // parser missing or parse failure: keep the declared label,
            // without protocol attributes
            return self.records_for(pairs, static_protocol, None);
        }

        if !pairs.has_requests() {
            return self.connect_fail_records(pairs);
        }

        if let Some(cached) = self.factory.cached_parsers(port) {
            for parser in cached.iter() {
                if let Some(records) = self.parse_protocol(pairs, parser) {
                    if NOSUPPORT == parser.protocol()
                        && parser.add_port_count(port) == CACHE_RESET_THRESHOLD
                    {
                        parser.reset_port(port);
                        self.factory.remove_cached_parser(port, parser);
                    }
                    return records;
                }
            }
        }

        for parser in &self.parsers {
            if let Some(records) = self.parse_protocol(pairs, parser) {
                if parser.add_port_count(port) == CACHE_ADD_THRESHOLD {
                    self.factory.add_cached_parser(port, parser.clone());
                }
                return records;
            }
        }
        self.records_for(pairs, NOSUPPORT, None)
    }

    /// Run one parser over the pairing state. `None` means the parser does
    /// not claim this traffic and the next candidate should be probed.
    fn parse_protocol(
        &self,
        pairs: &Arc<MessagePairs>,
        parser: &Arc<ProtocolParser>,
    ) -> Option<Vec<TransactionRecord>> {
        if parser.multi_requests() {
            return self.parse_multiple_requests(pairs, parser);
        }

        let (request_data, response_data) = {
            let state = pairs.state();
            (
                state.requests.as_ref().map(|r| r.data()),
                state.responses.as_ref().map(|r| r.data()),
            )
        };
        let mut request_msg = PayloadMessage::request(request_data?);
        if !parser.parse_request(&mut request_msg) {
            return None;
        }

        let Some(response_data) = response_data else {
            if request_msg.attributes.get_bool(labels::ONEWAY) {
                return Some(Vec::new());
            }
            return Some(self.records_for(pairs, parser.protocol(), Some(&request_msg.attributes)));
        };

        let mut response_msg =
            PayloadMessage::response(response_data, request_msg.attributes.clone());
        if !parser.parse_response(&mut response_msg) {
            return None;
        }
        Some(self.records_for(pairs, parser.protocol(), Some(&response_msg.attributes)))
    }

    /// Parse every buffered request individually and match responses back
    /// by the parser's pairing rule. Used for protocols that interleave
    /// several requests on one socket (DNS over TCP).
    fn parse_multiple_requests(
        &self,
        pairs: &Arc<MessagePairs>,
        parser: &Arc<ProtocolParser>,
    ) -> Option<Vec<TransactionRecord>> {
        let (request_events, response_events, nat_tuple) = {
            let state = pairs.state();
            let requests = state.requests.as_ref()?;
            let request_events: Vec<SockEvent> =
                (0..requests.len()).map(|i| requests.get(i).clone()).collect();
            let response_events: Option<Vec<SockEvent>> = state
                .responses
                .as_ref()
                .map(|r| (0..r.len()).map(|i| r.get(i).clone()).collect());
            (request_events, response_events, state.nat_tuple.clone())
        };

        let mut parsed_requests = Vec::with_capacity(request_events.len());
        for evt in &request_events {
            let mut msg = PayloadMessage::request(evt.data.clone());
            if !parser.parse_request(&mut msg) {
                return None;
            }
            parsed_requests.push(msg);
        }

        let mut records = Vec::new();
        let Some(response_events) = response_events else {
            for (i, evt) in request_events.iter().enumerate() {
                let pair = MessagePair {
                    request: evt.clone(),
                    response: None,
                    nat_tuple: nat_tuple.clone(),
                };
                records.push(self.record_with_single_pair(
                    &pair,
                    parser.protocol(),
                    &parsed_requests[i].attributes,
                ));
            }
            return Some(records);
        };

        let mut matched = vec![false; request_events.len()];
        for response in &response_events {
            let mut response_msg =
                PayloadMessage::response(response.data.clone(), AttributeMap::new());
            if !parser.parse_response(&mut response_msg) {
                return None;
            }
            let match_idx = parser.pair_match(&parsed_requests, &response_msg)?;
            matched[match_idx] = true;

            let pair = MessagePair {
                request: request_events[match_idx].clone(),
                response: Some(response.clone()),
                nat_tuple: nat_tuple.clone(),
            };
            records.push(self.record_with_single_pair(
                &pair,
                parser.protocol(),
                &response_msg.attributes,
            ));
        }

        // requests the responses never answered
        for (i, evt) in request_events.iter().enumerate() {
            if !matched[i] {
                let pair = MessagePair {
                    request: evt.clone(),
                    response: None,
                    nat_tuple: nat_tuple.clone(),
                };
                records.push(self.record_with_single_pair(
                    &pair,
                    parser.protocol(),
                    &parsed_requests[i].attributes,
                ));
            }
        }
        Some(records)
    }

    fn connect_fail_records(&self, pairs: &Arc<MessagePairs>) -> Vec<TransactionRecord> {
        let state = pairs.state();
        let Some(connects) = state.connects.as_ref() else {
            return Vec::new();
        };
        let evt = connects.first().clone();
        let connect_duration = connects.duration();
        let start_time = connects.start_time();
        drop(state);

        let mut record = self.pool.get();
        record.metrics.connect_time = connect_duration;
        record.metrics.request_total_time = connect_duration;

        let record_labels = &mut record.labels;
        record_labels.add_int(labels::PID, i64::from(evt.pid()));
        record_labels.add_int(labels::REQUEST_TID, 0);
        record_labels.add_int(labels::RESPONSE_TID, 0);
        record_labels.add_str(labels::COMM, evt.comm());
        record_labels.add_str(labels::SRC_IP, ip_string(evt.sip()));
        record_labels.add_str(labels::DST_IP, ip_string(evt.dip()));
        record_labels.add_int(labels::SRC_PORT, i64::from(evt.sport));
        record_labels.add_int(labels::DST_PORT, i64::from(evt.dport));
        record_labels.add_str(labels::DNAT_IP, labels::STR_EMPTY);
        record_labels.add_int(labels::DNAT_PORT, -1);
        record_labels.add_str(labels::CONTAINER_ID, evt.container_id());
        record_labels.add_bool(labels::IS_ERROR, true);
        record_labels.add_int(labels::ERROR_TYPE, ErrorType::ConnectFail.as_i64());
        record_labels.add_bool(labels::IS_SLOW, false);
        record_labels.add_bool(labels::IS_SERVER, evt.is_server());
        record.timestamp = start_time;
        vec![record]
    }

    fn records_for(
        &self,
        pairs: &Arc<MessagePairs>,
        protocol: &str,
        attributes: Option<&AttributeMap>,
    ) -> Vec<TransactionRecord> {
        // A request flagged as 100-continue is only the header half; put it
        // back in front of whatever the flow has buffered since and wait
        // for the body.
        if attributes.is_some_and(|a| a.has(labels::HTTP_CONTINUE)) {
            let requests = pairs.state().requests.clone();
            if let Some(request_seq) = requests {
                if let Some(current) = self
                    .request_monitor
                    .get(&pairs.key())
                    .map(|e| e.value().clone())
                {
                    current.put_request_back(request_seq);
                }
            }
            return Vec::new();
        }

        let state = pairs.state();
        let Some(requests) = state.requests.as_ref() else {
            return Vec::new();
        };
        let evt = requests.first().clone();

        let slow = state.responses.is_some() && self.is_slow(state.duration(), protocol);

        let mut record = self.pool.get();
        let record_labels = &mut record.labels;
        record_labels.add_int(labels::PID, i64::from(evt.pid()));
        record_labels.add_int(labels::REQUEST_TID, i64::from(evt.tid()));
        record_labels.add_int(
            labels::RESPONSE_TID,
            i64::from(state.responses.as_ref().map_or(0, |r| r.first().tid())),
        );
        record_labels.add_str(labels::COMM, evt.comm());
        record_labels.add_str(labels::SRC_IP, ip_string(evt.sip()));
        record_labels.add_str(labels::DST_IP, ip_string(evt.dip()));
        record_labels.add_int(labels::SRC_PORT, i64::from(evt.sport));
        record_labels.add_int(labels::DST_PORT, i64::from(evt.dport));
        record_labels.add_str(labels::DNAT_IP, labels::STR_EMPTY);
        record_labels.add_int(labels::DNAT_PORT, -1);
        record_labels.add_str(labels::CONTAINER_ID, evt.container_id());
        record_labels.add_bool(labels::IS_ERROR, false);
        record_labels.add_int(labels::ERROR_TYPE, ErrorType::NoError.as_i64());
        record_labels.add_bool(labels::IS_SLOW, slow);
        record_labels.add_bool(labels::IS_SERVER, evt.is_server());
        record_labels.add_str(labels::PROTOCOL, protocol);

        if let Some(attrs) = attributes {
            record_labels.merge(attrs);
        }

        if let Some(responses) = state.responses.as_ref() {
            record_labels.add_int(labels::END_TIMESTAMP, responses.last_timestamp() as i64);
        }

        record_labels.add_str(
            labels::REQUEST_PAYLOAD,
            payload_string(&requests.data(), protocol),
        );
        match state.responses.as_ref() {
            Some(responses) => record_labels.add_str(
                labels::RESPONSE_PAYLOAD,
                payload_string(&responses.data(), protocol),
            ),
            None => record_labels.add_str(labels::RESPONSE_PAYLOAD, labels::STR_EMPTY),
        }

        // a missing response outranks nothing, but not a protocol error
        if !record_labels.get_bool(labels::IS_ERROR) && state.responses.is_none() {
            record_labels.add_bool(labels::IS_ERROR, true);
            record_labels.add_int(labels::ERROR_TYPE, ErrorType::NoResponse.as_i64());
        }

        if let Some(nat) = state.nat_tuple.as_ref() {
            record_labels.add_str(labels::DNAT_IP, nat.repl_src_ip.to_string());
            record_labels.add_int(labels::DNAT_PORT, i64::from(nat.repl_src_port));
        }

        record.metrics.connect_time = state.connect_duration();
        record.metrics.request_sent_time = state.sent_time();
        record.metrics.waiting_ttfb_time = state.waiting_time();
        record.metrics.content_download_time = state.download_time();
        record.metrics.request_total_time = state.connect_duration() + state.duration();
        record.metrics.request_io = state.request_size();
        record.metrics.response_io = state.response_size();
        record.timestamp = requests.start_time();

        vec![record]
    }

    /// Record built from one request/response couple instead of the whole
    /// flow state. Used where a flow holds several real transactions.
    fn record_with_single_pair(
        &self,
        pair: &MessagePair,
        protocol: &str,
        attributes: &AttributeMap,
    ) -> TransactionRecord {
        let evt = &pair.request;
        let slow = self.is_slow(pair.duration(), protocol);

        let mut record = self.pool.get();
        let record_labels = &mut record.labels;
        record_labels.add_int(labels::PID, i64::from(evt.pid()));
        record_labels.add_int(labels::REQUEST_TID, i64::from(evt.tid()));
        record_labels.add_int(
            labels::RESPONSE_TID,
            i64::from(pair.response.as_ref().map_or(0, |r| r.tid())),
        );
        record_labels.add_str(labels::COMM, evt.comm());
        record_labels.add_str(labels::SRC_IP, ip_string(evt.sip()));
        record_labels.add_str(labels::DST_IP, ip_string(evt.dip()));
        record_labels.add_int(labels::SRC_PORT, i64::from(evt.sport));
        record_labels.add_int(labels::DST_PORT, i64::from(evt.dport));
        record_labels.add_str(labels::DNAT_IP, labels::STR_EMPTY);
        record_labels.add_int(labels::DNAT_PORT, -1);
        record_labels.add_str(labels::CONTAINER_ID, evt.container_id());
        record_labels.add_bool(labels::IS_ERROR, false);
        record_labels.add_int(labels::ERROR_TYPE, ErrorType::NoError.as_i64());
        record_labels.add_bool(labels::IS_SLOW, slow);
        record_labels.add_bool(labels::IS_SERVER, evt.is_server());
        record_labels.add_str(labels::PROTOCOL, protocol);

        record_labels.merge(attributes);

        if let Some(response) = pair.response.as_ref() {
            record_labels.add_int(labels::END_TIMESTAMP, response.timestamp as i64);
            record_labels.add_str(
                labels::RESPONSE_PAYLOAD,
                payload_string(&response.data, protocol),
            );
        } else {
            record_labels.add_str(labels::RESPONSE_PAYLOAD, labels::STR_EMPTY);
        }
        record_labels.add_str(labels::REQUEST_PAYLOAD, payload_string(&evt.data, protocol));

        if !record_labels.get_bool(labels::IS_ERROR) && pair.response.is_none() {
            record_labels.add_bool(labels::IS_ERROR, true);
            record_labels.add_int(labels::ERROR_TYPE, ErrorType::NoResponse.as_i64());
        }

        if let Some(nat) = pair.nat_tuple.as_ref() {
            record_labels.add_str(labels::DNAT_IP, nat.repl_src_ip.to_string());
            record_labels.add_int(labels::DNAT_PORT, i64::from(nat.repl_src_port));
        }

        record.metrics.connect_time = 0;
        record.metrics.request_sent_time = pair.sent_time();
        record.metrics.waiting_ttfb_time = pair.waiting_time();
        record.metrics.content_download_time = pair.download_time();
        record.metrics.request_total_time = pair.duration();
        record.metrics.request_io = pair.request_size();
        record.metrics.response_io = pair.response_size();
        record.timestamp = evt.start_time;
        record
    }

    fn is_slow(&self, duration_ns: u64, protocol: &str) -> bool {
        duration_ns >= self.slow_threshold(protocol).as_nanos() as u64
    }

    fn slow_threshold(&self, protocol: &str) -> Duration {
        match self.slow_thresholds.get(protocol) {
            Some(threshold) if !threshold.is_zero() => *threshold,
            _ => self.conf.response_slow_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use remora_common::{EventContext, FdInfo, L4Proto, ThreadInfo};

    use super::*;
    use crate::{
        conntrack::DisabledConntracker,
        consumers::testing::CollectingConsumer,
        runtime::conf::{AnalyzerConf, ProtocolConf},
    };

    const SEC: u64 = NANOS_PER_SEC;

    struct Harness {
        analyzer: Arc<NetworkAnalyzer>,
        collector: Arc<CollectingConsumer>,
    }

    fn harness(conf: AnalyzerConf) -> Harness {
        harness_with_snaplen(conf, None)
    }

    fn harness_with_snaplen(conf: AnalyzerConf, snaplen: Option<usize>) -> Harness {
        let collector = Arc::new(CollectingConsumer::default());
        let mut analyzer = NetworkAnalyzer::new(
            conf,
            Arc::new(DisabledConntracker),
            vec![collector.clone()],
        );
        if let Some(snaplen) = snaplen {
            analyzer.snaplen = snaplen;
        }
        Harness {
            analyzer: Arc::new(analyzer),
            collector,
        }
    }

    fn test_conf() -> AnalyzerConf {
        AnalyzerConf {
            connect_timeout: Duration::from_secs(1),
            fd_reuse_timeout: Duration::from_secs(2),
            no_response_threshold: Duration::from_secs(15),
            protocol_configs: vec![ProtocolConf {
                key: "dns".to_string(),
                ports: vec![53],
                ..ProtocolConf::default()
            }],
            ..AnalyzerConf::default()
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn event(
        name: SyscallKind,
        pid: u32,
        fd: i32,
        sport: u16,
        dport: u16,
        is_server: bool,
        proto: L4Proto,
        data: &[u8],
        ts: u64,
    ) -> SockEvent {
        SockEvent {
            name,
            category: EventCategory::Net,
            ctx: EventContext {
                thread_info: Some(ThreadInfo {
                    pid,
                    tid: pid + 1,
                    comm: "app".into(),
                    container_id: "c0ffee".into(),
                }),
                fd_info: Some(FdInfo {
                    fd,
                    sip: vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))],
                    dip: vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))],
                    is_server,
                    proto,
                }),
            },
            sport,
            dport,
            data: data.to_vec(),
            data_len: data.len() as u32,
            res_val: data.len() as i64,
            start_time: ts.saturating_sub(1_000_000),
            timestamp: ts,
        }
    }

    fn tcp_request(pid: u32, fd: i32, sport: u16, dport: u16, data: &[u8], ts: u64) -> SockEvent {
        event(SyscallKind::Write, pid, fd, sport, dport, false, L4Proto::Tcp, data, ts)
    }

    fn tcp_response(pid: u32, fd: i32, sport: u16, dport: u16, data: &[u8], ts: u64) -> SockEvent {
        event(SyscallKind::Read, pid, fd, sport, dport, false, L4Proto::Tcp, data, ts)
    }

    fn tcp_connect(pid: u32, fd: i32, sport: u16, dport: u16, ts: u64) -> SockEvent {
        event(SyscallKind::Connect, pid, fd, sport, dport, false, L4Proto::Tcp, b"", ts)
    }

    // minimal DNS wire helpers

    fn dns_name(domain: &str, out: &mut Vec<u8>) {
        for label in domain.split('.').filter(|l| !l.is_empty()) {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
    }

    fn dns_query(id: u16, domain: &str) -> Vec<u8> {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&id.to_be_bytes());
        pkt.extend_from_slice(&[0x01, 0x00]);
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt.extend_from_slice(&[0; 6]);
        dns_name(domain, &mut pkt);
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt
    }

    fn dns_answer(id: u16, domain: &str, rcode: u16, ips: &[[u8; 4]]) -> Vec<u8> {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&id.to_be_bytes());
        pkt.extend_from_slice(&(0x8000u16 | rcode).to_be_bytes());
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt.extend_from_slice(&(ips.len() as u16).to_be_bytes());
        pkt.extend_from_slice(&[0; 4]);
        dns_name(domain, &mut pkt);
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt.extend_from_slice(&1u16.to_be_bytes());
        for ip in ips {
            pkt.extend_from_slice(&[0xC0, 0x0C]);
            pkt.extend_from_slice(&1u16.to_be_bytes());
            pkt.extend_from_slice(&1u16.to_be_bytes());
            pkt.extend_from_slice(&300u32.to_be_bytes());
            pkt.extend_from_slice(&4u16.to_be_bytes());
            pkt.extend_from_slice(ip);
        }
        pkt
    }

    fn tcp_framed(pkt: &[u8]) -> Vec<u8> {
        let mut framed = (pkt.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(pkt);
        framed
    }

    fn records_len(harness: &Harness) -> usize {
        harness.collector.records.lock().unwrap().len()
    }

    #[tokio::test]
    async fn connect_without_request_emits_connect_fail() {
        let h = harness(test_conf());
        h.analyzer
            .process_event(tcp_connect(1, 10, 40000, 80, SEC))
            .await
            .unwrap();
        assert_eq!(records_len(&h), 0);

        h.analyzer.check_timeouts(1 + 16).await;

        let records = h.collector.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.labels.get_bool(labels::IS_ERROR));
        assert_eq!(
            record.labels.get_int(labels::ERROR_TYPE),
            Some(ErrorType::ConnectFail.as_i64())
        );
        assert!(!record.labels.get_bool(labels::IS_SLOW));
        // a single connect event spans no time
        assert_eq!(record.metrics.connect_time, 0);
        assert_eq!(record.labels.get_int(labels::DST_PORT), Some(80));
        assert_eq!(record.labels.get_int(labels::PID), Some(1));
        drop(records);
        assert!(h.analyzer.request_monitor.is_empty());
    }

    #[tokio::test]
    async fn http_happy_path_emits_one_record() {
        let h = harness(test_conf());
        h.analyzer
            .process_event(tcp_connect(1, 10, 40000, 80, SEC))
            .await
            .unwrap();
        h.analyzer
            .process_event(tcp_request(
                1,
                10,
                40000,
                80,
                b"GET /healthz HTTP/1.1\r\nHost: svc\r\n\r\n",
                2 * SEC,
            ))
            .await
            .unwrap();
        h.analyzer
            .process_event(tcp_response(
                1,
                10,
                40000,
                80,
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
                2 * SEC + 300_000_000,
            ))
            .await
            .unwrap();
        assert_eq!(records_len(&h), 0);

        // response present: flushed once the fd reuse window passes
        h.analyzer.check_timeouts(2 + 3).await;

        let records = h.collector.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.labels.get_str(labels::PROTOCOL), Some("http"));
        assert!(!record.labels.get_bool(labels::IS_ERROR));
        assert_eq!(
            record.labels.get_int(labels::ERROR_TYPE),
            Some(ErrorType::NoError.as_i64())
        );
        assert_eq!(record.labels.get_str(labels::HTTP_METHOD), Some("GET"));
        assert_eq!(record.labels.get_str(labels::HTTP_URL), Some("/healthz"));
        assert_eq!(record.labels.get_int(labels::HTTP_STATUS_CODE), Some(200));
        assert!(!record.labels.get_bool(labels::IS_SLOW));
        assert_eq!(record.metrics.request_total_time, 300_000_000);
        assert_eq!(record.metrics.waiting_ttfb_time, 300_000_000);
        let payload = record.labels.get_str(labels::REQUEST_PAYLOAD).unwrap();
        assert!(payload.starts_with("GET /healthz"));
        assert!(record.labels.get_int(labels::END_TIMESTAMP).is_some());
        drop(records);
        assert!(h.analyzer.request_monitor.is_empty());
    }

    #[tokio::test]
    async fn slow_transaction_is_flagged() {
        let mut conf = test_conf();
        conf.response_slow_threshold = Duration::from_millis(100);
        let h = harness(conf);

        h.analyzer
            .process_event(tcp_request(
                1,
                10,
                40000,
                80,
                b"GET / HTTP/1.1\r\n\r\n",
                SEC,
            ))
            .await
            .unwrap();
        h.analyzer
            .process_event(tcp_response(
                1,
                10,
                40000,
                80,
                b"HTTP/1.1 200 OK\r\n\r\n",
                SEC + 300_000_000,
            ))
            .await
            .unwrap();
        h.analyzer.check_timeouts(1 + 3).await;

        let records = h.collector.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].labels.get_bool(labels::IS_SLOW));
    }

    #[tokio::test]
    async fn dns_udp_query_pairs_with_its_response() {
        let h = harness(test_conf());
        h.analyzer
            .process_event(event(
                SyscallKind::SendTo,
                1,
                7,
                5353,
                53,
                false,
                L4Proto::Udp,
                &dns_query(0x1234, "a.b"),
                SEC,
            ))
            .await
            .unwrap();
        assert_eq!(records_len(&h), 0);
        assert_eq!(h.analyzer.dns_request_monitor.len(), 1);

        h.analyzer
            .process_event(event(
                SyscallKind::RecvFrom,
                1,
                7,
                5353,
                53,
                false,
                L4Proto::Udp,
                &dns_answer(0x1234, "a.b", 0, &[[1, 2, 3, 4]]),
                SEC + 50_000_000,
            ))
            .await
            .unwrap();

        let records = h.collector.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.labels.get_str(labels::PROTOCOL), Some(DNS));
        assert_eq!(record.labels.get_str(labels::DNS_DOMAIN), Some("a.b"));
        assert_eq!(record.labels.get_str(labels::DNS_IP), Some("1.2.3.4"));
        assert_eq!(record.labels.get_int(labels::DNS_ID), Some(0x1234));
        assert_eq!(record.labels.get_int(labels::DNS_RCODE), Some(0));
        assert!(!record.labels.get_bool(labels::IS_ERROR));
        drop(records);
        assert!(h.analyzer.dns_request_monitor.is_empty());
    }

    #[tokio::test]
    async fn dns_udp_mismatched_id_ages_out_as_no_response() {
        let h = harness(test_conf());
        h.analyzer
            .process_event(event(
                SyscallKind::SendTo,
                1,
                7,
                5353,
                53,
                false,
                L4Proto::Udp,
                &dns_query(1, "a.b"),
                SEC,
            ))
            .await
            .unwrap();
        h.analyzer
            .process_event(event(
                SyscallKind::RecvFrom,
                1,
                7,
                5353,
                53,
                false,
                L4Proto::Udp,
                &dns_answer(2, "a.b", 0, &[]),
                SEC + 1,
            ))
            .await
            .unwrap();
        // the response matched nothing and was dropped
        assert_eq!(records_len(&h), 0);

        h.analyzer.check_timeouts(1 + 15).await;

        let records = h.collector.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.labels.get_bool(labels::IS_ERROR));
        assert_eq!(
            record.labels.get_int(labels::ERROR_TYPE),
            Some(ErrorType::NoResponse.as_i64())
        );
        assert_eq!(record.labels.get_int(labels::DNS_ID), Some(1));
        assert_eq!(record.labels.get_str(labels::DNS_DOMAIN), Some("a.b"));
        drop(records);
        assert!(h.analyzer.dns_request_monitor.is_empty());
    }

    #[tokio::test]
    async fn dns_udp_sendmmsg_splits_into_queries() {
        let h = harness(test_conf());
        let mut evt = event(
            SyscallKind::SendMmsg,
            1,
            7,
            5353,
            53,
            false,
            L4Proto::Udp,
            b"",
            SEC,
        );
        evt.data =
            remora_common::encode_mmsg_segments([dns_query(1, "a.example"), dns_query(2, "b.example")]);
        evt.data_len = evt.data.len() as u32;
        evt.res_val = evt.data.len() as i64;
        h.analyzer.process_event(evt).await.unwrap();

        let cache = h
            .analyzer
            .dns_request_monitor
            .iter()
            .next()
            .unwrap()
            .value()
            .clone();
        let mut probe = AttributeMap::new();
        probe.add_int(labels::DNS_ID, 1);
        probe.add_str(labels::DNS_DOMAIN, "a.example");
        let (first, remaining) = cache.take_match(&probe);
        assert!(first.is_some());
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn dns_tcp_out_of_order_responses_pair_by_id_and_domain() {
        let h = harness(test_conf());
        h.analyzer
            .process_event(tcp_request(1, 9, 40000, 53, &tcp_framed(&dns_query(1, "x")), SEC))
            .await
            .unwrap();
        h.analyzer
            .process_event(tcp_request(
                1,
                9,
                40000,
                53,
                &tcp_framed(&dns_query(2, "y")),
                SEC + 100_000_000,
            ))
            .await
            .unwrap();
        h.analyzer
            .process_event(tcp_response(
                1,
                9,
                40000,
                53,
                &tcp_framed(&dns_answer(2, "y", 0, &[[2, 2, 2, 2]])),
                SEC + 200_000_000,
            ))
            .await
            .unwrap();
        h.analyzer
            .process_event(tcp_response(
                1,
                9,
                40000,
                53,
                &tcp_framed(&dns_answer(1, "x", 0, &[[1, 1, 1, 1]])),
                SEC + 300_000_000,
            ))
            .await
            .unwrap();
        assert_eq!(records_len(&h), 0);

        h.analyzer.check_timeouts(1 + 3).await;

        let records = h.collector.records.lock().unwrap();
        assert_eq!(records.len(), 2);
        // records follow response order; each pairs its own request
        assert_eq!(records[0].labels.get_int(labels::DNS_ID), Some(2));
        assert_eq!(records[0].labels.get_str(labels::DNS_DOMAIN), Some("y"));
        assert_eq!(records[0].labels.get_str(labels::DNS_IP), Some("2.2.2.2"));
        assert_eq!(records[1].labels.get_int(labels::DNS_ID), Some(1));
        assert_eq!(records[1].labels.get_str(labels::DNS_DOMAIN), Some("x"));
        assert_eq!(records[1].labels.get_str(labels::DNS_IP), Some("1.1.1.1"));
        for record in records.iter() {
            assert!(!record.labels.get_bool(labels::IS_ERROR));
            assert_eq!(record.labels.get_str(labels::PROTOCOL), Some(DNS));
        }
    }

    #[tokio::test]
    async fn dns_tcp_unmatched_request_becomes_no_response_record() {
        let h = harness(test_conf());
        h.analyzer
            .process_event(tcp_request(1, 9, 40000, 53, &tcp_framed(&dns_query(1, "x")), SEC))
            .await
            .unwrap();
        h.analyzer
            .process_event(tcp_request(
                1,
                9,
                40000,
                53,
                &tcp_framed(&dns_query(2, "y")),
                SEC + 100_000_000,
            ))
            .await
            .unwrap();
        h.analyzer
            .process_event(tcp_response(
                1,
                9,
                40000,
                53,
                &tcp_framed(&dns_answer(2, "y", 0, &[])),
                SEC + 200_000_000,
            ))
            .await
            .unwrap();
        h.analyzer.check_timeouts(1 + 3).await;

        let records = h.collector.records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].labels.get_int(labels::DNS_ID), Some(2));
        assert!(!records[0].labels.get_bool(labels::IS_ERROR));
        assert_eq!(records[1].labels.get_int(labels::DNS_ID), Some(1));
        assert_eq!(
            records[1].labels.get_int(labels::ERROR_TYPE),
            Some(ErrorType::NoResponse.as_i64())
        );
    }

    #[tokio::test]
    async fn request_with_changed_sport_flushes_old_state() {
        let h = harness(test_conf());
        h.analyzer
            .process_event(tcp_request(1, 10, 40000, 9999, b"ping body", SEC))
            .await
            .unwrap();
        assert_eq!(records_len(&h), 0);

        h.analyzer
            .process_event(tcp_request(1, 10, 40001, 9999, b"second body", 2 * SEC))
            .await
            .unwrap();

        let records = h.collector.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.labels.get_str(labels::PROTOCOL), Some(NOSUPPORT));
        assert_eq!(
            record.labels.get_int(labels::ERROR_TYPE),
            Some(ErrorType::NoResponse.as_i64())
        );
        assert_eq!(record.labels.get_int(labels::SRC_PORT), Some(40000));
        drop(records);

        let key = PairKey { pid: 1, fd: 10 };
        let pairs = h.analyzer.request_monitor.get(&key).unwrap().value().clone();
        let state = pairs.state();
        let requests = state.requests.as_ref().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests.first().sport, 40001);
    }

    #[tokio::test]
    async fn same_sport_requests_merge_without_flush() {
        let h = harness(test_conf());
        h.analyzer
            .process_event(tcp_request(1, 10, 40000, 9999, b"part one ", SEC))
            .await
            .unwrap();
        h.analyzer
            .process_event(tcp_request(1, 10, 40000, 9999, b"part two", SEC + 1000))
            .await
            .unwrap();

        assert_eq!(records_len(&h), 0);
        let key = PairKey { pid: 1, fd: 10 };
        let pairs = h.analyzer.request_monitor.get(&key).unwrap().value().clone();
        let state = pairs.state();
        assert_eq!(state.requests.as_ref().unwrap().len(), 2);
        assert_eq!(state.requests.as_ref().unwrap().data(), b"part one part two");
    }

    #[tokio::test]
    async fn no_response_flush_fires_only_past_threshold() {
        let h = harness(test_conf());
        h.analyzer
            .process_event(tcp_request(1, 10, 40000, 9999, b"lonely request", 10 * SEC))
            .await
            .unwrap();

        h.analyzer.check_timeouts(10 + 14).await;
        assert_eq!(records_len(&h), 0);

        h.analyzer.check_timeouts(10 + 15).await;
        assert_eq!(records_len(&h), 1);
    }

    #[tokio::test]
    async fn transaction_emits_at_most_once() {
        let h = harness(test_conf());
        h.analyzer
            .process_event(tcp_request(1, 10, 40000, 9999, b"only request", SEC))
            .await
            .unwrap();

        let pairs = h
            .analyzer
            .request_monitor
            .iter()
            .next()
            .unwrap()
            .value()
            .clone();

        h.analyzer.check_timeouts(1 + 20).await;
        // a racing flush of the same state is latched out
        h.analyzer.distribute_trace_metric(pairs, None).await;
        h.analyzer.check_timeouts(1 + 40).await;

        assert_eq!(records_len(&h), 1);
    }

    #[tokio::test]
    async fn captured_payload_respects_snaplen() {
        let h = harness_with_snaplen(test_conf(), Some(10));
        for i in 0..3u64 {
            h.analyzer
                .process_event(tcp_request(
                    1,
                    10,
                    40000,
                    9999,
                    b"abcdef",
                    SEC + i * 1000,
                ))
                .await
                .unwrap();
        }
        h.analyzer.check_timeouts(1 + 20).await;

        let records = h.collector.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        let payload = record.labels.get_str(labels::REQUEST_PAYLOAD).unwrap();
        assert_eq!(payload.len(), 10);
        // reported io still counts the uncaptured bytes
        assert_eq!(record.metrics.request_io, 18);
    }

    #[tokio::test]
    async fn parser_is_cached_after_add_threshold() {
        let h = harness(test_conf());
        let port = 7777u16;
        let now = 1_000_000u64;

        for i in 0..CACHE_ADD_THRESHOLD {
            let fd = i as i32 + 100;
            h.analyzer
                .process_event(tcp_request(
                    1,
                    fd,
                    40000,
                    port,
                    b"GET /ping HTTP/1.1\r\n\r\n",
                    SEC,
                ))
                .await
                .unwrap();
            if i == CACHE_ADD_THRESHOLD - 2 {
                h.analyzer.check_timeouts(now).await;
                assert!(h.analyzer.factory.cached_parsers(port).is_none());
            }
        }
        h.analyzer.check_timeouts(now).await;

        let cached = h.analyzer.factory.cached_parsers(port).unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].protocol(), "http");
    }

    #[tokio::test]
    async fn nosupport_sentinel_is_evicted_after_reset_threshold() {
        let h = harness(test_conf());
        let port = 4242u16;
        let generic = h.analyzer.factory.generic_parser();
        h.analyzer.factory.add_cached_parser(port, generic);

        let mut hits = 0u32;
        for _ in 0..CACHE_RESET_THRESHOLD + 10 {
            let pairs = Arc::new(MessagePairs::with_request(
                tcp_request(1, 10, 40000, port, b"\x00\x01 opaque bytes", SEC),
                DEFAULT_SNAPLEN,
            ));
            let records = h.analyzer.parse_protocols(&pairs);
            assert!(!records.is_empty());
            for record in records {
                h.analyzer.pool.free(record);
            }
            hits += 1;
            if h.analyzer.factory.cached_parsers(port).is_none() {
                break;
            }
        }
        assert_eq!(hits, CACHE_RESET_THRESHOLD);
    }

    #[tokio::test]
    async fn http_continue_holds_the_request_for_its_body() {
        let h = harness(test_conf());
        h.analyzer
            .process_event(tcp_request(
                1,
                10,
                40000,
                8080,
                b"POST /upload HTTP/1.1\r\nExpect: 100-continue\r\n\r\n",
                SEC,
            ))
            .await
            .unwrap();
        h.analyzer
            .process_event(tcp_response(
                1,
                10,
                40000,
                8080,
                b"HTTP/1.1 100 Continue\r\n\r\n",
                SEC + 10_000_000,
            ))
            .await
            .unwrap();
        // the body arrives as a fresh request on the same key
        h.analyzer
            .process_event(tcp_request(
                1,
                10,
                40000,
                8080,
                b"name=value",
                SEC + 20_000_000,
            ))
            .await
            .unwrap();
        // no intermediate record for the header half
        assert_eq!(records_len(&h), 0);

        h.analyzer
            .process_event(tcp_response(
                1,
                10,
                40000,
                8080,
                b"HTTP/1.1 201 Created\r\n\r\n",
                SEC + 30_000_000,
            ))
            .await
            .unwrap();
        h.analyzer.check_timeouts(1 + 5).await;

        let records = h.collector.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.labels.get_str(labels::PROTOCOL), Some("http"));
        assert_eq!(record.labels.get_str(labels::HTTP_METHOD), Some("POST"));
        assert_eq!(record.labels.get_int(labels::HTTP_STATUS_CODE), Some(201));
        let payload = record.labels.get_str(labels::REQUEST_PAYLOAD).unwrap();
        assert!(payload.starts_with("POST /upload"));
        assert!(payload.contains("name=value"));
    }

    #[tokio::test]
    async fn non_dns_udp_is_ignored() {
        let h = harness(test_conf());
        h.analyzer
            .process_event(event(
                SyscallKind::SendTo,
                1,
                7,
                5353,
                5000,
                false,
                L4Proto::Udp,
                b"some datagram",
                SEC,
            ))
            .await
            .unwrap();
        assert!(h.analyzer.dns_request_monitor.is_empty());
        assert!(h.analyzer.request_monitor.is_empty());
    }

    #[tokio::test]
    async fn failed_syscalls_are_dropped() {
        let h = harness(test_conf());
        let mut evt = tcp_request(1, 10, 40000, 80, b"GET / HTTP/1.1\r\n\r\n", SEC);
        evt.res_val = -11;
        h.analyzer.process_event(evt).await.unwrap();
        assert!(h.analyzer.request_monitor.is_empty());
    }

    #[tokio::test]
    async fn undirectional_syscall_surfaces_an_error() {
        let h = harness(test_conf());
        let evt = event(
            SyscallKind::Other,
            1,
            10,
            40000,
            80,
            false,
            L4Proto::Tcp,
            b"x",
            SEC,
        );
        assert!(h.analyzer.process_event(evt).await.is_err());
    }

    #[tokio::test]
    async fn connect_retry_within_window_merges() {
        let h = harness(test_conf());
        h.analyzer
            .process_event(tcp_connect(1, 10, 40000, 80, SEC))
            .await
            .unwrap();
        h.analyzer
            .process_event(tcp_connect(1, 10, 40000, 80, SEC + 500_000_000))
            .await
            .unwrap();
        assert_eq!(records_len(&h), 0);

        let key = PairKey { pid: 1, fd: 10 };
        let pairs = h.analyzer.request_monitor.get(&key).unwrap().value().clone();
        let state = pairs.state();
        assert_eq!(state.connects.as_ref().unwrap().len(), 2);
        // merged retries span their arrival window
        assert_eq!(state.connects.as_ref().unwrap().duration(), 500_000_000);
    }

    #[tokio::test]
    async fn late_connect_flushes_the_stale_attempt() {
        let h = harness(test_conf());
        h.analyzer
            .process_event(tcp_connect(1, 10, 40000, 80, SEC))
            .await
            .unwrap();
        // arrives past the connect timeout window
        h.analyzer
            .process_event(tcp_connect(1, 10, 40000, 80, 5 * SEC))
            .await
            .unwrap();

        let records = h.collector.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].labels.get_int(labels::ERROR_TYPE),
            Some(ErrorType::ConnectFail.as_i64())
        );
        drop(records);

        // the fresh attempt replaced the flushed one
        let key = PairKey { pid: 1, fd: 10 };
        let pairs = h.analyzer.request_monitor.get(&key).unwrap().value().clone();
        let state = pairs.state();
        assert_eq!(state.connects.as_ref().unwrap().len(), 1);
        assert_eq!(state.connects.as_ref().unwrap().first().timestamp, 5 * SEC);
    }

    #[tokio::test]
    async fn static_port_label_survives_parse_failure() {
        let mut conf = test_conf();
        conf.protocol_configs.push(ProtocolConf {
            key: "http".to_string(),
            ports: vec![8088],
            ..ProtocolConf::default()
        });
        let h = harness(conf);

        // not parseable as HTTP, but the operator pinned the port
        h.analyzer
            .process_event(tcp_request(1, 10, 40000, 8088, b"\x01\x02\x03 not http at all", SEC))
            .await
            .unwrap();
        h.analyzer.check_timeouts(1 + 20).await;

        let records = h.collector.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].labels.get_str(labels::PROTOCOL), Some("http"));
        assert!(records[0].labels.get_str(labels::HTTP_METHOD).is_none());
    }

    #[tokio::test]
    async fn channel_feeds_the_running_event_loop() {
        // keep the wall-clock sweeper out of this test
        let mut conf = test_conf();
        conf.enable_timeout_check = false;
        let h = harness(conf);
        h.analyzer.start();
        h.analyzer
            .consume_event(tcp_request(1, 10, 40000, 9999, b"via channel", SEC))
            .await
            .unwrap();

        // wait for the consumer task to drain the channel
        for _ in 0..50 {
            if !h.analyzer.request_monitor.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.analyzer.request_monitor.len(), 1);
        h.analyzer.shutdown();
    }
}
