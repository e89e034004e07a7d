//! IMAP protocol analyzer module
//!
//! Tracks IMAP sessions riding on a transport flow and reports commands,
//! responses and literal payloads as events.
//!
//! - Client/server roles are inferred from the first line
//! - COMPRESS DEFLATE (RFC 4978) is followed through a DEFLATE decoder
//! - STARTTLS ends inspection of the flow

pub mod analyzer;
pub mod parser;
pub mod state;
pub mod types;

use std::sync::Arc;

pub use analyzer::{ImapAnalyzer, ImapEvents, ImapProtocol};
pub use state::ImapConntrack;
pub use types::{ImapState, IMAP_CMD, IMAP_PLOAD, IMAP_RSP};

use crate::conntrack::ConntrackInfo;
use super::registry::ProtocolRegistration;
use super::traits::{Protocol, ProtocolInit};

fn create(init: &ProtocolInit<'_>) -> crate::Result<Arc<dyn Protocol>> {
    Ok(Arc::new(ImapProtocol::new(init)?))
}

/// IMAP has no key of its own: one entry per transport flow
pub fn registration() -> ProtocolRegistration {
    ProtocolRegistration {
        name: types::IMAP_SOURCE,
        tcp_ports: types::IMAP_PORTS,
        ct_info: ConntrackInfo::new(1, false),
        create,
    }
}
