//! IMAP per-flow state

use std::any::Any;

use tracing::{debug, warn};

use crate::conntrack::ConntrackPriv;
use crate::core::Direction;
use crate::decoder::Decoder;
use crate::event::Event;
use crate::stream::StreamParser;
use crate::types::Value;
use super::types::{ImapState, RSP_TEXT};

/// A command or response kept open until its literal is drained
pub struct PendingUnit {
    /// None when nobody listened at the time the line was seen
    pub evt: Option<Event>,
    /// Command name or response status
    pub head: String,
    /// Command argument or response text, continuation lines appended
    pub text: String,
}

impl PendingUnit {
    pub fn new(evt: Option<Event>, head: &str, text: Option<&str>) -> Self {
        Self {
            evt,
            head: head.to_string(),
            text: text.unwrap_or_default().to_string(),
        }
    }

    /// Value of the `cmd` field of payload events opened by this unit
    pub fn summary(&self) -> String {
        if self.text.is_empty() {
            self.head.clone()
        } else {
            format!("{} {}", self.head, self.text)
        }
    }

    /// Append a response continuation line
    pub fn append_text(&mut self, line: &str) -> crate::Result<()> {
        self.text.push_str(line);
        if let Some(evt) = self.evt.as_mut() {
            evt.set(RSP_TEXT, Value::String(self.text.clone()))?;
        }
        Ok(())
    }

    pub fn end(self) -> crate::Result<()> {
        if let Some(evt) = self.evt {
            evt.finish()?;
        }
        Ok(())
    }
}

/// Private state of an IMAP conntrack entry
pub struct ImapConntrack {
    pub state: ImapState,
    /// Fixed by the first line seen
    pub server_direction: Option<Direction>,
    pub(crate) parsers: [StreamParser; 2],
    pub(crate) decoders: [Option<Box<dyn Decoder>>; 2],
    /// Literal bytes still expected, per direction
    pub data_bytes: [u64; 2],
    pub(crate) cmd: Option<PendingUnit>,
    pub(crate) rsp: Option<PendingUnit>,
    pub(crate) pload: [Option<Event>; 2],
}

impl ImapConntrack {
    pub fn new(max_line: usize) -> Self {
        Self {
            state: ImapState::Normal,
            server_direction: None,
            parsers: [StreamParser::new(max_line), StreamParser::new(max_line)],
            decoders: [None, None],
            data_bytes: [0, 0],
            cmd: None,
            rsp: None,
            pload: [None, None],
        }
    }

    pub fn is_server(&self, dir: Direction) -> bool {
        self.server_direction == Some(dir)
    }

    /// Bytes buffered in `dir` that did not make a full line yet
    pub fn buffered(&self, dir: Direction) -> usize {
        self.parsers[dir.index()].remaining_len()
    }

    pub fn has_pending(&self) -> bool {
        self.cmd.is_some() || self.rsp.is_some() || self.data_bytes.iter().any(|n| *n > 0)
    }

    pub fn is_decoding(&self) -> bool {
        self.decoders.iter().any(|d| d.is_some())
    }
}

impl ConntrackPriv for ImapConntrack {
    fn cleanup(self: Box<Self>) -> crate::Result<()> {
        let this = *self;
        let mut result = Ok(());

        // Started events are ended so listeners always see a matching end
        let events = this
            .pload
            .into_iter()
            .flatten()
            .chain(this.cmd.and_then(|c| c.evt))
            .chain(this.rsp.and_then(|r| r.evt));

        for evt in events {
            if let Err(e) = evt.finish() {
                warn!("Unable to close IMAP event at teardown: {}", e);
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }

        debug!("IMAP flow released in state {}", this.state);
        result
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
