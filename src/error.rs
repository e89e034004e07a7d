use thiserror::Error;

use crate::conntrack::ConntrackError;
use crate::decoder::DecodeError;
use crate::event::EventError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("conntrack error: {0}")]
    Conntrack(#[from] ConntrackError),

    #[error("event error: {0}")]
    Event(#[from] EventError),

    #[error("decoder error: {0}")]
    Decode(#[from] DecodeError),

    #[error("config error: {0}")]
    Config(String),

    #[error("protocol {0} is not registered")]
    UnknownProtocol(String),

    #[error("protocol {0} is already registered")]
    DuplicateProtocol(String),

    #[error("protocol {proto} failed: {msg}")]
    Protocol { proto: &'static str, msg: String },

    #[error("transcript line {line}: {msg}")]
    Transcript { line: usize, msg: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
