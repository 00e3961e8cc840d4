//! Socket event model shared between the capture layer and the remora agent.
//!
//! The capture layer (kernel-side syscall probes) produces one [`SockEvent`]
//! per observed socket syscall. The agent consumes them and never mutates
//! them, so the model is plain owned data with cheap accessors that mirror
//! what the probes can actually fill in: any of the context blocks may be
//! missing when the probe lost the race against fd teardown.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Event classification assigned by the capture layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventCategory {
    /// Socket I/O. The only category the analyzer processes.
    Net,
    /// Everything else (file I/O, process lifecycle, ...).
    Other,
}

/// Transport protocol of the socket behind the fd.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum L4Proto {
    Tcp,
    Udp,
    Unknown,
}

/// Syscalls the capture layer reports for sockets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyscallKind {
    Read,
    Write,
    Readv,
    Writev,
    SendTo,
    RecvFrom,
    SendMsg,
    RecvMsg,
    SendMmsg,
    Connect,
    Other,
}

/// Data direction of a syscall relative to the observed process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Bytes flowing into the process (read side).
    In,
    /// Bytes flowing out of the process (write side).
    Out,
}

impl SyscallKind {
    /// The direction of the payload, if the syscall carries one.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            SyscallKind::Read | SyscallKind::Readv | SyscallKind::RecvFrom | SyscallKind::RecvMsg => {
                Some(Direction::In)
            }
            SyscallKind::Write
            | SyscallKind::Writev
            | SyscallKind::SendTo
            | SyscallKind::SendMsg
            | SyscallKind::SendMmsg => Some(Direction::Out),
            SyscallKind::Connect | SyscallKind::Other => None,
        }
    }
}

/// Process/thread identity attached to an event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub pid: u32,
    pub tid: u32,
    pub comm: String,
    pub container_id: String,
}

/// Socket identity attached to an event.
///
/// `sip`/`dip` are vectors because the probe reports every address bound to
/// the fd; the first entry is the primary one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdInfo {
    pub fd: i32,
    pub sip: Vec<IpAddr>,
    pub dip: Vec<IpAddr>,
    /// True when the observed process is the accepting side of the socket.
    pub is_server: bool,
    pub proto: L4Proto,
}

impl Default for L4Proto {
    fn default() -> Self {
        L4Proto::Unknown
    }
}

/// Context blocks the probe attaches to an event. Either may be missing.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventContext {
    pub thread_info: Option<ThreadInfo>,
    pub fd_info: Option<FdInfo>,
}

#[derive(Debug, Error)]
pub enum EventError {
    /// The syscall kind carries no payload direction, so the event cannot
    /// be classified as request or response.
    #[error("cannot classify direction of syscall {0:?}")]
    UnknownDirection(SyscallKind),
}

/// One captured socket syscall.
///
/// `data` is truncated to the capture snap length by the probe; `res_val`
/// still reports the full syscall return so byte accounting stays exact.
/// `start_time`/`timestamp` are syscall entry/exit in nanoseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SockEvent {
    pub name: SyscallKind,
    pub category: EventCategory,
    pub ctx: EventContext,
    pub sport: u16,
    pub dport: u16,
    pub data: Vec<u8>,
    pub data_len: u32,
    pub res_val: i64,
    pub start_time: u64,
    pub timestamp: u64,
}

impl SockEvent {
    pub fn pid(&self) -> u32 {
        self.ctx.thread_info.as_ref().map_or(0, |t| t.pid)
    }

    pub fn tid(&self) -> u32 {
        self.ctx.thread_info.as_ref().map_or(0, |t| t.tid)
    }

    pub fn comm(&self) -> &str {
        self.ctx.thread_info.as_ref().map_or("", |t| t.comm.as_str())
    }

    pub fn container_id(&self) -> &str {
        self.ctx
            .thread_info
            .as_ref()
            .map_or("", |t| t.container_id.as_str())
    }

    pub fn fd(&self) -> i32 {
        self.ctx.fd_info.as_ref().map_or(-1, |f| f.fd)
    }

    /// Primary source address, if the probe captured one.
    pub fn sip(&self) -> Option<IpAddr> {
        self.ctx.fd_info.as_ref().and_then(|f| f.sip.first().copied())
    }

    /// Primary destination address, if the probe captured one.
    pub fn dip(&self) -> Option<IpAddr> {
        self.ctx.fd_info.as_ref().and_then(|f| f.dip.first().copied())
    }

    pub fn is_server(&self) -> bool {
        self.ctx.fd_info.as_ref().is_some_and(|f| f.is_server)
    }

    pub fn is_udp(&self) -> bool {
        self.ctx
            .fd_info
            .as_ref()
            .is_some_and(|f| f.proto == L4Proto::Udp)
    }

    pub fn is_connect(&self) -> bool {
        self.name == SyscallKind::Connect
    }

    /// Whether this event belongs to the request half of a transaction.
    ///
    /// A server reads requests and writes responses; a client does the
    /// opposite. Syscalls without a payload direction cannot be classified.
    pub fn is_request(&self) -> Result<bool, EventError> {
        let direction = self
            .name
            .direction()
            .ok_or(EventError::UnknownDirection(self.name))?;
        Ok(match direction {
            Direction::In => self.is_server(),
            Direction::Out => !self.is_server(),
        })
    }

    /// Split a `sendmmsg` capture into one event per message.
    ///
    /// The probe encodes the vector payload as repeated `u32`-LE
    /// length-prefixed segments. Anything that is not well-formed framing
    /// degrades to the event itself, unsplit.
    pub fn split_sendmmsg(&self) -> Vec<SockEvent> {
        if self.name != SyscallKind::SendMmsg {
            return vec![self.clone()];
        }

        let mut segments = Vec::new();
        let mut rest = self.data.as_slice();
        while !rest.is_empty() {
            if rest.len() < 4 {
                return vec![self.clone()];
            }
            let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            rest = &rest[4..];
            if len > rest.len() {
                return vec![self.clone()];
            }
            segments.push(rest[..len].to_vec());
            rest = &rest[len..];
        }
        if segments.is_empty() {
            return vec![self.clone()];
        }

        segments
            .into_iter()
            .map(|payload| {
                let mut evt = self.clone();
                evt.data_len = payload.len() as u32;
                evt.res_val = payload.len() as i64;
                evt.data = payload;
                evt
            })
            .collect()
    }
}

/// Encode payloads the way the capture layer frames `sendmmsg` data.
pub fn encode_mmsg_segments<I, P>(payloads: I) -> Vec<u8>
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut out = Vec::new();
    for payload in payloads {
        let payload = payload.as_ref();
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
    }
    out
}
