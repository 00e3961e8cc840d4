//! Last-resort parser.
//!
//! Claims any payload without extracting attributes, so unknown traffic
//! still produces a record. Its protocol label is the no-support marker,
//! which also makes it the sentinel the analyzer's port cache watches for
//! when deciding to give other parsers another chance on a port.

use crate::{message::PayloadMessage, PkgParser, ProtocolParser, NOSUPPORT};

pub fn parser() -> ProtocolParser {
    ProtocolParser::new(
        NOSUPPORT,
        false,
        accept_all(),
        accept_all(),
        None,
    )
}

fn accept_all() -> PkgParser {
    PkgParser::new(
        Box::new(|_: &PayloadMessage| false),
        Box::new(|_: &mut PayloadMessage| (true, true)),
    )
}
