//! DNS parser (RFC 1035).
//!
//! The TCP variant carries a two-byte length prefix and supports several
//! in-flight queries per socket, so it is registered as a multi-request
//! protocol with an id+domain pair matcher. The UDP variant parses the
//! datagram directly; pairing happens in the analyzer's UDP query cache.

use std::net::Ipv4Addr;

use crate::{
    labels,
    labels::ErrorType,
    message::PayloadMessage,
    PairMatchFn, PkgParser, ProtocolParser, DNS,
};

pub const DNS_HEADER_SIZE: usize = 12;

const TYPE_A: u16 = 1;

// RFC 1035 section 2.3.4: a compressed name can never need more pointers
// than half its maximum wire size.
const MAX_DOMAIN_WIRE_OCTETS: usize = 255;
const MAX_COMPRESSION_POINTERS: usize = (MAX_DOMAIN_WIRE_OCTETS + 1) / 2 - 2;

/// TCP DNS: length-prefixed frames, out-of-order query multiplexing.
pub fn tcp_parser() -> ProtocolParser {
    ProtocolParser::new(
        DNS,
        true,
        PkgParser::new(
            Box::new(fastfail),
            Box::new(|msg| {
                msg.offset += 2;
                parse_request(msg)
            }),
        ),
        PkgParser::new(
            Box::new(fastfail),
            Box::new(|msg| {
                msg.offset += 2;
                parse_response(msg)
            }),
        ),
        Some(pair_match()),
    )
}

/// UDP DNS: one datagram per message, no stream framing.
pub fn udp_parser() -> ProtocolParser {
    ProtocolParser::new(
        DNS,
        false,
        PkgParser::new(Box::new(fastfail), Box::new(parse_request)),
        PkgParser::new(Box::new(fastfail), Box::new(parse_response)),
        None,
    )
}

fn fastfail(message: &PayloadMessage) -> bool {
    message.data.len() <= DNS_HEADER_SIZE
}

fn pair_match() -> PairMatchFn {
    Box::new(|requests, response| {
        requests.iter().position(|request| {
            request.attributes.get_int(labels::DNS_ID)
                == response.attributes.get_int(labels::DNS_ID)
                && request.attributes.get_str(labels::DNS_DOMAIN)
                    == response.attributes.get_str(labels::DNS_DOMAIN)
        })
    })
}

fn parse_request(message: &mut PayloadMessage) -> (bool, bool) {
    let offset = message.offset;
    let id = message.read_u16_be(offset).unwrap_or(0);

    let questions = message.read_u16_be(offset + 4).unwrap_or(0);
    if questions == 0 {
        return (false, true);
    }
    let Some(domain) = read_query(message, questions) else {
        return (false, true);
    };

    message.attributes.add_int(labels::DNS_ID, i64::from(id));
    message.attributes.add_str(labels::DNS_DOMAIN, domain);
    (true, true)
}

fn parse_response(message: &mut PayloadMessage) -> (bool, bool) {
    let offset = message.offset;
    let id = message.read_u16_be(offset).unwrap_or(0);
    let flags = message.read_u16_be(offset + 2).unwrap_or(0);
    let rcode = flags & 0xf;

    let questions = message.read_u16_be(offset + 4).unwrap_or(0);
    let answers = message.read_u16_be(offset + 6).unwrap_or(0);

    if questions == 0 {
        return (false, true);
    }
    let Some(domain) = read_query(message, questions) else {
        return (false, true);
    };

    let ip = read_ipv4_answers(message, answers);

    message.attributes.add_str(labels::DNS_DOMAIN, domain);
    if !ip.is_empty() {
        message.attributes.add_str(labels::DNS_IP, ip);
    }
    message.attributes.add_int(labels::DNS_ID, i64::from(id));
    message.attributes.add_int(labels::DNS_RCODE, i64::from(rcode));
    if rcode > 0 {
        message.attributes.add_bool(labels::IS_ERROR, true);
        message
            .attributes
            .add_int(labels::ERROR_TYPE, ErrorType::ProtocolError.as_i64());
    }
    (true, true)
}

/// Walk the question section. Returns the first query name and leaves the
/// message cursor on the section that follows.
fn read_query(message: &mut PayloadMessage, questions: u16) -> Option<String> {
    let mut domain = String::new();
    let mut offset = message.offset + DNS_HEADER_SIZE;

    for _ in 0..questions {
        if message.is_complete() {
            return None;
        }
        let (name, next) = unpack_domain_name(&message.data, offset)?;
        if next >= message.data.len() {
            return None;
        }
        if domain.is_empty() {
            domain = name;
        }
        // qtype + qclass
        offset = next + 4;
    }
    message.offset = offset;
    Some(domain)
}

/// Decode a possibly-compressed domain name starting at `offset`.
/// Returns the dotted name and the offset just past it.
fn unpack_domain_name(data: &[u8], offset: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    let mut off = offset;
    let mut after_pointers: Option<usize> = None;
    let mut pointers = 0usize;

    loop {
        let &len = data.get(off)?;
        off += 1;
        match len & 0xC0 {
            0x00 => {
                if len == 0 {
                    break;
                }
                let label = data.get(off..off + len as usize)?;
                if !name.is_empty() {
                    name.push('.');
                }
                for &b in label {
                    name.push(b as char);
                }
                if name.len() > MAX_DOMAIN_WIRE_OCTETS {
                    return None;
                }
                off += len as usize;
            }
            0xC0 => {
                pointers += 1;
                if pointers > MAX_COMPRESSION_POINTERS {
                    return None;
                }
                let &low = data.get(off)?;
                off += 1;
                if after_pointers.is_none() {
                    after_pointers = Some(off);
                }
                off = usize::from(len & 0x3F) << 8 | usize::from(low);
            }
            // 0x80 and 0x40 are reserved label types
            _ => return None,
        }
    }

    Some((name, after_pointers.unwrap_or(off)))
}

/// Collect A-record answers into a comma-joined address list, advancing the
/// message cursor over the answer section.
fn read_ipv4_answers(message: &mut PayloadMessage, answers: u16) -> String {
    let mut ips: Vec<String> = Vec::new();
    let mut offset = message.offset;

    for _ in 0..answers {
        // compressed name pointer
        offset += 2;
        let Some(atype) = message.read_u16_be(offset) else {
            break;
        };

        // type + class + ttl
        offset += 8;
        let Some(rdlength) = message.read_u16_be(offset) else {
            break;
        };

        offset += 2;
        if atype == TYPE_A && rdlength == 4 {
            let Some(raw) = message.read_bytes(offset, 4) else {
                break;
            };
            ips.push(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]).to_string());
        }
        offset += rdlength as usize;
    }
    message.offset = offset;
    ips.join(",")
}
