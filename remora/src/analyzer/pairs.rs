//! Flow keys, the bounded event sequence and the per-flow pairing state.

use std::net::IpAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, MutexGuard,
};
use std::time::Duration;

use remora_common::SockEvent;

use crate::conntrack::NatTuple;

pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Identity of a TCP-style flow: one process, one fd. Scoped to a process
/// so fd reuse after close shows up as a source-port change on this key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub pid: u32,
    pub fd: i32,
}

impl PairKey {
    pub fn from_event(evt: &SockEvent) -> Self {
        Self {
            pid: evt.pid(),
            fd: evt.fd(),
        }
    }
}

/// Identity of a DNS-capable UDP flow. The full 4-tuple is part of the key
/// because one socket multiplexes queries to many resolvers.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UdpKey {
    pub pid: u32,
    pub fd: i32,
    pub sip: Option<IpAddr>,
    pub dip: Option<IpAddr>,
    pub sport: u16,
    pub dport: u16,
}

impl UdpKey {
    pub fn from_event(evt: &SockEvent) -> Self {
        Self {
            pid: evt.pid(),
            fd: evt.fd(),
            sip: evt.sip(),
            dip: evt.dip(),
            sport: evt.sport,
            dport: evt.dport,
        }
    }
}

/// An ordered capture of events for one direction of a flow.
///
/// Every event is retained for its metadata, but payload bytes stop being
/// kept once the sequence holds `max_payload` captured bytes in total.
/// Timestamps are event exit times; the duration of a single event is
/// therefore zero, and of a merged sequence the span between its first and
/// last event.
#[derive(Clone, Debug)]
pub struct EventSeq {
    events: Vec<SockEvent>,
    max_payload: usize,
    captured: usize,
    reported: u64,
    first_ts: u64,
    last_ts: u64,
    first_start: u64,
    sport: u16,
}

impl EventSeq {
    pub fn new(evt: SockEvent, max_payload: usize) -> Self {
        let mut seq = Self {
            events: Vec::with_capacity(1),
            max_payload,
            captured: 0,
            reported: 0,
            first_ts: evt.timestamp,
            last_ts: evt.timestamp,
            first_start: evt.start_time,
            sport: evt.sport,
        };
        seq.push(evt);
        seq
    }

    fn push(&mut self, mut evt: SockEvent) {
        let remaining = self.max_payload.saturating_sub(self.captured);
        if evt.data.len() > remaining {
            evt.data.truncate(remaining);
        }
        self.captured += evt.data.len();
        self.reported += evt.res_val.max(0) as u64;
        self.first_ts = self.first_ts.min(evt.timestamp);
        self.last_ts = self.last_ts.max(evt.timestamp);
        self.events.push(evt);
    }

    pub fn merge(&mut self, evt: SockEvent) {
        self.push(evt);
    }

    /// Splice an earlier sequence in front of this one, keeping event order.
    pub fn prepend(&mut self, mut earlier: EventSeq) {
        earlier.events.append(&mut self.events);
        self.events = earlier.events;
        self.captured += earlier.captured;
        self.reported += earlier.reported;
        self.first_ts = self.first_ts.min(earlier.first_ts);
        self.last_ts = self.last_ts.max(earlier.last_ts);
        self.first_start = earlier.first_start;
        self.sport = earlier.sport;
    }

    pub fn first(&self) -> &SockEvent {
        &self.events[0]
    }

    pub fn get(&self, index: usize) -> &SockEvent {
        &self.events[index]
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Captured payload bytes of the whole sequence, in order.
    pub fn data(&self) -> Vec<u8> {
        let mut merged = Vec::with_capacity(self.captured);
        for evt in &self.events {
            merged.extend_from_slice(&evt.data);
        }
        merged
    }

    pub fn captured_bytes(&self) -> usize {
        self.captured
    }

    /// Bytes the syscalls reported, independent of capture truncation.
    pub fn reported_bytes(&self) -> u64 {
        self.reported
    }

    pub fn duration(&self) -> u64 {
        self.last_ts - self.first_ts
    }

    pub fn first_timestamp(&self) -> u64 {
        self.first_ts
    }

    pub fn last_timestamp(&self) -> u64 {
        self.last_ts
    }

    pub fn start_time(&self) -> u64 {
        self.first_start
    }

    pub fn sport_changed(&self, evt: &SockEvent) -> bool {
        self.sport != evt.sport
    }

    /// Whether `evt` arrived too long after this sequence to belong to it.
    pub fn is_timeout(&self, evt: &SockEvent, timeout: Duration) -> bool {
        evt.timestamp.saturating_sub(self.last_ts) >= timeout.as_nanos() as u64
    }
}

/// The mutable half of a flow state, guarded by the entry lock.
#[derive(Debug, Default)]
pub struct PairsState {
    pub connects: Option<EventSeq>,
    pub requests: Option<EventSeq>,
    pub responses: Option<EventSeq>,
    pub nat_tuple: Option<NatTuple>,
}

impl PairsState {
    /// Timestamp of the latest event seen on this flow, if any.
    pub fn last_event_timestamp(&self) -> Option<u64> {
        [&self.connects, &self.requests, &self.responses]
            .into_iter()
            .flatten()
            .map(|seq| seq.last_timestamp())
            .max()
    }

    pub fn connect_duration(&self) -> u64 {
        self.connects.as_ref().map_or(0, |c| c.duration())
    }

    pub fn sent_time(&self) -> u64 {
        self.requests.as_ref().map_or(0, |r| r.duration())
    }

    pub fn waiting_time(&self) -> u64 {
        match (&self.requests, &self.responses) {
            (Some(req), Some(resp)) => {
                resp.first_timestamp().saturating_sub(req.last_timestamp())
            }
            _ => 0,
        }
    }

    pub fn download_time(&self) -> u64 {
        self.responses.as_ref().map_or(0, |r| r.duration())
    }

    /// Span from the first request to the end of the transaction.
    pub fn duration(&self) -> u64 {
        match (&self.requests, &self.responses) {
            (Some(req), Some(resp)) => {
                resp.last_timestamp().saturating_sub(req.first_timestamp())
            }
            (Some(req), None) => req.duration(),
            _ => 0,
        }
    }

    pub fn request_size(&self) -> u64 {
        self.requests.as_ref().map_or(0, |r| r.reported_bytes())
    }

    pub fn response_size(&self) -> u64 {
        self.responses.as_ref().map_or(0, |r| r.reported_bytes())
    }
}

/// In-flight pairing state of one flow.
///
/// The concurrent map owns exactly one of these per key; the router and
/// the sweeper both reach it, so mutation goes through the internal lock
/// and emission through the single-shot `sent` latch.
#[derive(Debug)]
pub struct MessagePairs {
    key: PairKey,
    max_payload: usize,
    sent: AtomicBool,
    state: Mutex<PairsState>,
}

impl MessagePairs {
    pub fn with_connect(evt: SockEvent, max_payload: usize) -> Self {
        let key = PairKey::from_event(&evt);
        Self {
            key,
            max_payload,
            sent: AtomicBool::new(false),
            state: Mutex::new(PairsState {
                connects: Some(EventSeq::new(evt, max_payload)),
                ..PairsState::default()
            }),
        }
    }

    pub fn with_request(evt: SockEvent, max_payload: usize) -> Self {
        let key = PairKey::from_event(&evt);
        Self {
            key,
            max_payload,
            sent: AtomicBool::new(false),
            state: Mutex::new(PairsState {
                requests: Some(EventSeq::new(evt, max_payload)),
                ..PairsState::default()
            }),
        }
    }

    pub fn key(&self) -> PairKey {
        self.key
    }

    pub fn state(&self) -> MutexGuard<'_, PairsState> {
        self.state.lock().expect("message pairs lock poisoned")
    }

    pub fn has_connects(&self) -> bool {
        self.state().connects.is_some()
    }

    pub fn has_requests(&self) -> bool {
        self.state().requests.is_some()
    }

    pub fn has_responses(&self) -> bool {
        self.state().responses.is_some()
    }

    pub fn merge_connect(&self, evt: SockEvent) {
        let mut state = self.state();
        match &mut state.connects {
            Some(seq) => seq.merge(evt),
            None => state.connects = Some(EventSeq::new(evt, self.max_payload)),
        }
    }

    pub fn merge_request(&self, evt: SockEvent) {
        let mut state = self.state();
        match &mut state.requests {
            Some(seq) => seq.merge(evt),
            None => state.requests = Some(EventSeq::new(evt, self.max_payload)),
        }
    }

    /// Append a response; ignored while no request has been seen.
    pub fn merge_response(&self, evt: SockEvent) {
        let mut state = self.state();
        if state.requests.is_none() {
            return;
        }
        match &mut state.responses {
            Some(seq) => seq.merge(evt),
            None => state.responses = Some(EventSeq::new(evt, self.max_payload)),
        }
    }

    /// Whether a new connect attempt is too late to merge into this state.
    pub fn connect_timed_out(&self, evt: &SockEvent, timeout: Duration) -> bool {
        self.state()
            .connects
            .as_ref()
            .is_some_and(|c| c.is_timeout(evt, timeout))
    }

    pub fn request_sport_changed(&self, evt: &SockEvent) -> bool {
        self.state()
            .requests
            .as_ref()
            .is_some_and(|r| r.sport_changed(evt))
    }

    /// Re-install a request sequence that turned out to be incomplete,
    /// in front of whatever requests have arrived since.
    pub fn put_request_back(&self, seq: EventSeq) {
        let mut state = self.state();
        match &mut state.requests {
            Some(current) => current.prepend(seq),
            None => state.requests = Some(seq),
        }
    }

    pub fn set_nat_tuple(&self, nat: Option<NatTuple>) {
        self.state().nat_tuple = nat;
    }

    /// First event that opened this flow, used for record identity labels.
    pub fn query_event(&self) -> Option<SockEvent> {
        let state = self.state();
        if let Some(connects) = &state.connects {
            return Some(connects.first().clone());
        }
        state.requests.as_ref().map(|r| r.first().clone())
    }

    /// Single-shot emission latch. The first caller wins; later callers
    /// (the racing sweeper or router) get `false` and must not emit.
    pub fn check_send(&self) -> bool {
        self.sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// One request/response couple, used where a flow carries several real
/// requests (DNS) and for the UDP query cache.
#[derive(Clone, Debug)]
pub struct MessagePair {
    pub request: SockEvent,
    pub response: Option<SockEvent>,
    pub nat_tuple: Option<NatTuple>,
}

impl MessagePair {
    pub fn sent_time(&self) -> u64 {
        self.request.timestamp.saturating_sub(self.request.start_time)
    }

    pub fn waiting_time(&self) -> u64 {
        self.response
            .as_ref()
            .map_or(0, |r| r.start_time.saturating_sub(self.request.timestamp))
    }

    pub fn download_time(&self) -> u64 {
        self.response
            .as_ref()
            .map_or(0, |r| r.timestamp.saturating_sub(r.start_time))
    }

    pub fn duration(&self) -> u64 {
        self.response
            .as_ref()
            .map_or(0, |r| r.timestamp.saturating_sub(self.request.timestamp))
    }

    pub fn request_size(&self) -> u64 {
        self.request.res_val.max(0) as u64
    }

    pub fn response_size(&self) -> u64 {
        self.response.as_ref().map_or(0, |r| r.res_val.max(0) as u64)
    }
}
