//! Application protocol parser catalog for the remora agent.
//!
//! Every protocol is described by a [`ProtocolParser`]: a cheap reject
//! check plus a full package parser per direction, an optional
//! request/response pair matcher for protocols that multiplex several
//! requests on one socket, and per-port feedback counters the analyzer
//! uses to learn which parser a port speaks.
//!
//! Parsers are pure byte-level code. They never block and never panic on
//! arbitrary input; a payload they do not claim is simply rejected so the
//! caller can probe the next candidate.

pub mod dns;
pub mod factory;
pub mod generic;
pub mod http;
pub mod labels;
pub mod message;

use dashmap::DashMap;
use lazy_static::lazy_static;

pub use crate::message::{AttrValue, AttributeMap, PayloadMessage};

pub const HTTP: &str = "http";
pub const DNS: &str = "dns";
pub const NOSUPPORT: &str = "NOSUPPORT";

/// Default number of payload bytes rendered into record labels.
pub const DEFAULT_PAYLOAD_LENGTH: usize = 80;

/// Cheap pre-check: `true` rejects the payload without a full parse.
pub type FastFailFn = Box<dyn Fn(&PayloadMessage) -> bool + Send + Sync>;

/// Full package parse. Returns `(claimed, done)`: `claimed` means this
/// parser recognizes the payload and has populated the message attributes;
/// `done` means no further package of the same payload remains.
pub type ParsePkgFn = Box<dyn Fn(&mut PayloadMessage) -> (bool, bool) + Send + Sync>;

/// Select which pending request a response belongs to.
pub type PairMatchFn =
    Box<dyn Fn(&[PayloadMessage], &PayloadMessage) -> Option<usize> + Send + Sync>;

/// One direction of a protocol: reject check + parser.
pub struct PkgParser {
    pub fast_fail: FastFailFn,
    pub parse: ParsePkgFn,
}

impl PkgParser {
    pub fn new(fast_fail: FastFailFn, parse: ParsePkgFn) -> Self {
        Self { fast_fail, parse }
    }

    fn run(&self, message: &mut PayloadMessage) -> bool {
        if (self.fast_fail)(message) {
            return false;
        }
        let (claimed, _done) = (self.parse)(message);
        claimed
    }
}

/// A registered application protocol.
pub struct ProtocolParser {
    protocol: &'static str,
    multi_requests: bool,
    request: PkgParser,
    response: PkgParser,
    pair_match: Option<PairMatchFn>,
    port_counts: DashMap<u16, u32>,
}

impl ProtocolParser {
    pub fn new(
        protocol: &'static str,
        multi_requests: bool,
        request: PkgParser,
        response: PkgParser,
        pair_match: Option<PairMatchFn>,
    ) -> Self {
        Self {
            protocol,
            multi_requests,
            request,
            response,
            pair_match,
            port_counts: DashMap::new(),
        }
    }

    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    /// Whether requests on one socket must be parsed and matched
    /// individually instead of as one merged buffer.
    pub fn multi_requests(&self) -> bool {
        self.multi_requests
    }

    /// Parse a request payload; `true` claims it and fills its attributes.
    pub fn parse_request(&self, message: &mut PayloadMessage) -> bool {
        self.request.run(message)
    }

    /// Parse a response payload; `true` claims it and fills its attributes.
    pub fn parse_response(&self, message: &mut PayloadMessage) -> bool {
        self.response.run(message)
    }

    /// Index of the pending request this response answers, if the protocol
    /// supports out-of-order matching.
    pub fn pair_match(
        &self,
        requests: &[PayloadMessage],
        response: &PayloadMessage,
    ) -> Option<usize> {
        self.pair_match.as_ref().and_then(|m| m(requests, response))
    }

    /// Bump this parser's hit counter for `port` and return the new count.
    pub fn add_port_count(&self, port: u16) -> u32 {
        let mut entry = self.port_counts.entry(port).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Forget the hit counter for `port`.
    pub fn reset_port(&self, port: u16) {
        self.port_counts.remove(&port);
    }
}

lazy_static! {
    /// Per-protocol override of how many payload bytes records carry.
    static ref PAYLOAD_LENGTHS: DashMap<String, usize> = DashMap::new();
}

/// Configure the payload length rendered for `protocol` (0 keeps the default).
pub fn set_payload_length(protocol: &str, length: usize) {
    if length > 0 {
        PAYLOAD_LENGTHS.insert(protocol.to_string(), length);
    }
}

fn payload_length(protocol: &str) -> usize {
    PAYLOAD_LENGTHS
        .get(protocol)
        .map(|e| *e.value())
        .unwrap_or(DEFAULT_PAYLOAD_LENGTH)
}

/// Printable rendition of a payload, truncated to the protocol's configured
/// length. Non-graphic bytes become `.` so binary protocols stay loggable.
pub fn payload_string(data: &[u8], protocol: &str) -> String {
    let limit = payload_length(protocol);
    data.iter()
        .take(limit)
        .map(|&b| {
            let c = b as char;
            if c.is_ascii_graphic() || c == ' ' {
                c
            } else {
                '.'
            }
        })
        .collect()
}
