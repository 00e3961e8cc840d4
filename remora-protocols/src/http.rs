//! HTTP/1.x parser.
//!
//! Extracts the method and a clustered URL from requests and the status
//! code from responses. URLs are clustered before they become record
//! attributes so high-cardinality paths collapse into stable endpoint
//! labels. A `100 Continue` status marks the message so the analyzer can
//! hold the request open for the body that follows.

use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::space1,
    IResult,
};
use serde::{Deserialize, Serialize};

use crate::{
    labels,
    labels::ErrorType,
    message::PayloadMessage,
    PkgParser, ProtocolParser, HTTP,
};

const METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS", "CONNECT", "TRACE",
];

/// Minimum bytes for a plausible request line ("GET / HTTP/1.0" and up).
const MIN_REQUEST_LEN: usize = 14;
/// Minimum bytes for a plausible status line ("HTTP/1.1 200").
const MIN_RESPONSE_LEN: usize = 12;

/// How URL paths collapse into endpoint labels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlClusterMethod {
    /// Replace any path segment containing non-alphabetic characters with `*`.
    #[default]
    Alphabet,
    /// Only strip the query string.
    NoParam,
}

impl UrlClusterMethod {
    pub fn cluster(&self, path: &str) -> String {
        let path = path.split('?').next().unwrap_or("");
        if path.is_empty() {
            return "/".to_string();
        }
        match self {
            UrlClusterMethod::NoParam => path.to_string(),
            UrlClusterMethod::Alphabet => {
                let clustered: Vec<&str> = path
                    .split('/')
                    .map(|segment| {
                        if segment.is_empty() || segment.chars().all(|c| c.is_ascii_alphabetic()) {
                            segment
                        } else {
                            "*"
                        }
                    })
                    .collect();
                clustered.join("/")
            }
        }
    }
}

pub fn parser(cluster_method: UrlClusterMethod) -> ProtocolParser {
    ProtocolParser::new(
        HTTP,
        false,
        PkgParser::new(
            Box::new(fastfail_request),
            Box::new(move |msg| parse_request(msg, cluster_method)),
        ),
        PkgParser::new(Box::new(fastfail_response), Box::new(parse_response)),
        None,
    )
}

fn fastfail_request(message: &PayloadMessage) -> bool {
    if message.data.len() < MIN_REQUEST_LEN {
        return true;
    }
    !METHODS.iter().any(|m| {
        message.data.len() > m.len()
            && message.data.starts_with(m.as_bytes())
            && message.data[m.len()] == b' '
    })
}

fn fastfail_response(message: &PayloadMessage) -> bool {
    message.data.len() < MIN_RESPONSE_LEN || !message.data.starts_with(b"HTTP/")
}

fn token(input: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while1(|c: u8| c != b' ' && c != b'\r' && c != b'\n')(input)
}

fn parse_request_line(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8], &[u8])> {
    let (input, method) = take_while1(|c: u8| c.is_ascii_uppercase())(input)?;
    let (input, _) = space1(input)?;
    let (input, path) = token(input)?;
    let (input, _) = space1(input)?;
    let (input, version) = tag(&b"HTTP/"[..])(input)?;
    Ok((input, (method, path, version)))
}

fn parse_status_line(input: &[u8]) -> IResult<&[u8], u16> {
    let (input, _version) = token(input)?;
    let (input, _) = space1(input)?;
    let (input, code_bytes) = take_while1(|c: u8| c.is_ascii_digit())(input)?;
    let code = std::str::from_utf8(code_bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    Ok((input, code))
}

fn parse_request(message: &mut PayloadMessage, cluster_method: UrlClusterMethod) -> (bool, bool) {
    let Ok((_, (method, path, _))) = parse_request_line(&message.data) else {
        return (false, true);
    };
    let method = String::from_utf8_lossy(method).to_string();
    let path = String::from_utf8_lossy(path).to_string();

    message.attributes.add_str(labels::HTTP_METHOD, method);
    message
        .attributes
        .add_str(labels::HTTP_URL, cluster_method.cluster(&path));
    (true, true)
}

fn parse_response(message: &mut PayloadMessage) -> (bool, bool) {
    let Ok((_, code)) = parse_status_line(&message.data) else {
        return (false, true);
    };
    if code < 100 || code > 599 {
        return (false, true);
    }

    message
        .attributes
        .add_int(labels::HTTP_STATUS_CODE, i64::from(code));
    if code == 100 {
        message.attributes.add_bool(labels::HTTP_CONTINUE, true);
    }
    if code >= 400 {
        message.attributes.add_bool(labels::IS_ERROR, true);
        message
            .attributes
            .add_int(labels::ERROR_TYPE, ErrorType::ProtocolError.as_i64());
    }
    (true, true)
}
