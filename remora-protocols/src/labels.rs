//! Label keys and error codes shared between parsers and record assembly.

pub const PID: &str = "pid";
pub const REQUEST_TID: &str = "request_tid";
pub const RESPONSE_TID: &str = "response_tid";
pub const COMM: &str = "comm";
pub const SRC_IP: &str = "src_ip";
pub const DST_IP: &str = "dst_ip";
pub const SRC_PORT: &str = "src_port";
pub const DST_PORT: &str = "dst_port";
pub const DNAT_IP: &str = "dnat_ip";
pub const DNAT_PORT: &str = "dnat_port";
pub const CONTAINER_ID: &str = "container_id";
pub const IS_ERROR: &str = "is_error";
pub const ERROR_TYPE: &str = "error_type";
pub const IS_SLOW: &str = "is_slow";
pub const IS_SERVER: &str = "is_server";
pub const PROTOCOL: &str = "protocol";
pub const END_TIMESTAMP: &str = "end_timestamp";
pub const REQUEST_PAYLOAD: &str = "request_payload";
pub const RESPONSE_PAYLOAD: &str = "response_payload";

pub const HTTP_METHOD: &str = "http_method";
pub const HTTP_URL: &str = "http_url";
pub const HTTP_STATUS_CODE: &str = "http_status_code";
pub const HTTP_CONTINUE: &str = "http_continue";

pub const DNS_ID: &str = "dns_id";
pub const DNS_DOMAIN: &str = "dns_domain";
pub const DNS_IP: &str = "dns_ip";
pub const DNS_RCODE: &str = "dns_rcode";

pub const ONEWAY: &str = "oneway";

pub const STR_EMPTY: &str = "";

/// Failure classification carried in the `error_type` label.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i64)]
pub enum ErrorType {
    NoError = 0,
    ProtocolError = 1,
    NoResponse = 2,
    ConnectFail = 3,
}

impl ErrorType {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}
