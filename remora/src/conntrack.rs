//! Conntrack seam.
//!
//! DNAT resolution is provided by an external collaborator; the analyzer
//! only needs the reply tuple for the flow it is about to emit. The
//! disabled implementation stands in when conntrack is off or the netlink
//! backend is unavailable.

use std::net::IpAddr;

use serde::Serialize;

/// Post-NAT destination reported by conntrack for a flow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NatTuple {
    pub repl_src_ip: IpAddr,
    pub repl_src_port: u16,
}

pub trait Conntracker: Send + Sync {
    /// Reply tuple for the given original-direction flow, if conntrack
    /// knows of a translation.
    fn get_dnat_tuple(
        &self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        is_udp: bool,
    ) -> Option<NatTuple>;
}

/// Conntracker used when DNAT resolution is disabled.
#[derive(Debug, Default)]
pub struct DisabledConntracker;

impl Conntracker for DisabledConntracker {
    fn get_dnat_tuple(
        &self,
        _src_ip: IpAddr,
        _dst_ip: IpAddr,
        _src_port: u16,
        _dst_port: u16,
        _is_udp: bool,
    ) -> Option<NatTuple> {
        None
    }
}
