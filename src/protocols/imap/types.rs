//! IMAP event schemas and flow states

use serde::Serialize;

use crate::event::DataItemReg;
use crate::types::ValueType;

/// Source name of every IMAP event
pub const IMAP_SOURCE: &str = "imap";

pub const IMAP_CMD: &str = "imap_cmd";
pub const IMAP_RSP: &str = "imap_rsp";
pub const IMAP_PLOAD: &str = "imap_pload";

/// Default IMAP port
pub const IMAP_PORTS: &[u16] = &[143];

/// Longest digit run accepted in a literal length
pub const MAX_LITERAL_DIGITS: usize = 31;

pub const CMD_TAG: usize = 0;
pub const CMD_NAME: usize = 1;
pub const CMD_ARG: usize = 2;

pub const CMD_FIELDS: &[DataItemReg] = &[
    DataItemReg::new("tag", ValueType::String),
    DataItemReg::new("name", ValueType::String),
    DataItemReg::new("arg", ValueType::String),
];

pub const RSP_TAG: usize = 0;
pub const RSP_STATUS: usize = 1;
pub const RSP_TEXT: usize = 2;

pub const RSP_FIELDS: &[DataItemReg] = &[
    DataItemReg::new("tag", ValueType::String),
    DataItemReg::new("status", ValueType::String),
    DataItemReg::new("text", ValueType::String),
];

pub const PLOAD_CMD: usize = 0;
pub const PLOAD_SIZE: usize = 1;

pub const PLOAD_FIELDS: &[DataItemReg] = &[
    DataItemReg::new("cmd", ValueType::String),
    DataItemReg::new("size", ValueType::U64),
];

/// Inspection state of an IMAP flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImapState {
    Normal,
    /// Client asked for COMPRESS DEFLATE, waiting for the server
    CompressRequested,
    /// Both directions go through a DEFLATE decoder
    CompressActive,
    /// Client asked for STARTTLS, waiting for the server
    StartTlsRequested,
    /// Stream is encrypted, nothing more to see
    TlsActive,
    /// Unparseable input
    Invalid,
}

impl ImapState {
    pub fn is_requested(self) -> bool {
        matches!(self, ImapState::CompressRequested | ImapState::StartTlsRequested)
    }

    /// No further bytes of the flow are looked at
    pub fn stops_inspection(self) -> bool {
        matches!(self, ImapState::TlsActive | ImapState::Invalid)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ImapState::Normal => "normal",
            ImapState::CompressRequested => "compress_requested",
            ImapState::CompressActive => "compress_active",
            ImapState::StartTlsRequested => "starttls_requested",
            ImapState::TlsActive => "tls_active",
            ImapState::Invalid => "invalid",
        }
    }
}

impl std::fmt::Display for ImapState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
