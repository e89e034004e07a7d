//! IMAP stream analyzer
//!
//! Drives the per-flow [`ImapConntrack`] state machine over reassembled
//! segments and emits `imap_cmd`, `imap_rsp` and `imap_pload` events.
//!
//! # Flow handling
//!
//! - The first line decides which direction is the server
//! - `{N}` literals are framed out of the line stream and delivered as
//!   updates of an `imap_pload` event
//! - After COMPRESS DEFLATE both directions are inflated before parsing
//! - After STARTTLS nothing more is inspected

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::conntrack::EntryId;
use crate::core::{Direction, StreamSegment};
use crate::decoder::{decode_growable, DeflateDecoder};
use crate::event::{Event, EventKind, EventKindInfo, EventRegistry};
use crate::protocols::traits::{ProcessContext, ProcessStatus, Protocol, ProtocolInit};
use crate::types::Value;
use crate::{Error, Result};

use super::parser::{
    is_server_line, parse_command, parse_literal, parse_response, starts_with_ignore_case,
    takeover_heuristic, Literal,
};
use super::state::{ImapConntrack, PendingUnit};
use super::types::*;

/// Registered IMAP event kinds
#[derive(Clone)]
pub struct ImapEvents {
    pub cmd: Arc<EventKind>,
    pub rsp: Arc<EventKind>,
    pub pload: Arc<EventKind>,
}

impl ImapEvents {
    pub fn register(events: &EventRegistry) -> Result<Self> {
        let cmd = events.register(
            EventKindInfo::new(IMAP_CMD, IMAP_SOURCE, "IMAP command").with_data(CMD_FIELDS),
        )?;
        let rsp = events.register(
            EventKindInfo::new(IMAP_RSP, IMAP_SOURCE, "IMAP response").with_data(RSP_FIELDS),
        )?;
        let pload = events.register(
            EventKindInfo::new(IMAP_PLOAD, IMAP_SOURCE, "IMAP literal payload")
                .with_data(PLOAD_FIELDS),
        )?;
        Ok(Self { cmd, rsp, pload })
    }
}

/// IMAP protocol
pub struct ImapProtocol {
    events: ImapEvents,
}

impl ImapProtocol {
    pub fn new(init: &ProtocolInit<'_>) -> Result<Self> {
        Ok(Self {
            events: ImapEvents::register(init.events)?,
        })
    }

    pub fn events(&self) -> &ImapEvents {
        &self.events
    }
}

impl Protocol for ImapProtocol {
    fn name(&self) -> &'static str {
        IMAP_SOURCE
    }

    fn process(&self, ctx: &ProcessContext<'_>, segment: &StreamSegment<'_>) -> Result<ProcessStatus> {
        let parent = segment.parent.as_ref().ok_or_else(|| Error::Protocol {
            proto: IMAP_SOURCE,
            msg: "segment has no transport flow".to_string(),
        })?;
        let ce = ctx.table.get_unique_from_parent(parent)?;

        let mut entry = ce.lock();
        // Still linked while its cleanup runs
        if entry.is_destroyed() {
            trace!("IMAP flow {} is being destroyed, segment ignored", ce.id());
            return Ok(ProcessStatus::Stop);
        }
        if !entry.has_private() {
            trace!("New IMAP flow {} under {}", ce.id(), parent.id());
            entry.set_private(Box::new(ImapConntrack::new(ctx.config.imap.max_line_len)));
        }
        let flow = entry
            .private_mut::<ImapConntrack>()
            .ok_or_else(|| Error::Protocol {
                proto: IMAP_SOURCE,
                msg: format!("conntrack {} carries foreign private state", ce.id()),
            })?;

        let analyzer = ImapAnalyzer {
            events: &self.events,
            conntrack: ce.id(),
            ts: segment.ts,
        };
        analyzer.process(flow, segment.direction, segment.payload)
    }

    fn cleanup(&self, _events: &EventRegistry) -> Result<()> {
        debug!("IMAP protocol unregistered");
        Ok(())
    }
}

/// One segment's worth of processing
pub struct ImapAnalyzer<'a> {
    pub events: &'a ImapEvents,
    pub conntrack: EntryId,
    pub ts: DateTime<Utc>,
}

impl<'a> ImapAnalyzer<'a> {
    pub fn process(&self, st: &mut ImapConntrack, dir: Direction, payload: &[u8]) -> Result<ProcessStatus> {
        if st.state.stops_inspection() {
            return Ok(ProcessStatus::Stop);
        }
        let d = dir.index();

        if st.state == ImapState::CompressActive {
            let Some(decoded) = self.inflate(st, dir, payload) else {
                return Ok(ProcessStatus::Stop);
            };
            st.parsers[d].add_payload(&decoded);
        } else {
            st.parsers[d].add_payload(payload);
        }

        loop {
            self.check_takeover(st, dir);
            if st.state.stops_inspection() {
                return Ok(ProcessStatus::Stop);
            }

            if st.data_bytes[d] > 0 && !self.drain_payload(st, dir)? {
                return Ok(ProcessStatus::WantMore);
            }

            if st.state.stops_inspection() {
                return Ok(ProcessStatus::Stop);
            }

            let Some(raw) = st.parsers[d].get_line() else {
                break;
            };
            if raw.is_empty() {
                continue;
            }
            let line = String::from_utf8_lossy(&raw).into_owned();

            if st.server_direction.is_none() {
                let server = if is_server_line(&line) { dir } else { dir.reverse() };
                debug!("IMAP {} server direction is {}", self.conntrack, server);
                st.server_direction = Some(server);
            }

            if st.is_server(dir) {
                self.handle_response(st, dir, &raw, &line)?;
            } else {
                self.handle_command(st, dir, &raw, &line)?;
            }
        }

        if st.has_pending() || st.buffered(dir) > 0 {
            Ok(ProcessStatus::WantMore)
        } else {
            Ok(ProcessStatus::Ok)
        }
    }

    /// The server's answer to a layer change may be missing; look at what
    /// the client sends next
    fn check_takeover(&self, st: &mut ImapConntrack, dir: Direction) {
        let d = dir.index();
        if !st.state.is_requested()
            || st.server_direction != Some(dir.reverse())
            || st.parsers[d].remaining_len() == 0
        {
            return;
        }
        if takeover_heuristic(st.parsers[d].remaining()) {
            debug!("IMAP {} switched layers without an acknowledgment", self.conntrack);
            self.activate(st);
        } else {
            debug!("IMAP {} layer change not taken, back to normal", self.conntrack);
            st.state = ImapState::Normal;
        }
    }

    fn alloc(&self, kind: &Arc<EventKind>) -> Option<Event> {
        if !kind.has_listeners() {
            return None;
        }
        let mut evt = Event::alloc(kind);
        evt.set_timestamp(self.ts);
        evt.set_conntrack(self.conntrack);
        Some(evt)
    }

    fn handle_command(&self, st: &mut ImapConntrack, dir: Direction, raw: &[u8], line: &str) -> Result<()> {
        let Some(cmd) = parse_command(line) else {
            debug!("IMAP {} command without a space after its tag", self.conntrack);
            st.state = ImapState::Invalid;
            return Ok(());
        };

        if st.state == ImapState::Normal {
            if cmd.name.eq_ignore_ascii_case("COMPRESS")
                && cmd.arg.map_or(false, |a| a.eq_ignore_ascii_case("DEFLATE"))
            {
                st.state = ImapState::CompressRequested;
            } else if cmd.name.eq_ignore_ascii_case("STARTTLS") {
                st.state = ImapState::StartTlsRequested;
            }
        }

        let mut evt = self.alloc(&self.events.cmd);
        if let Some(evt) = evt.as_mut() {
            evt.set(CMD_TAG, Value::from(cmd.tag))?;
            evt.set(CMD_NAME, Value::from(cmd.name))?;
            if let Some(arg) = cmd.arg {
                evt.set(CMD_ARG, Value::from(arg))?;
            }
        }

        match parse_literal(raw) {
            Literal::Size(size) => {
                if let Some(evt) = evt.as_mut() {
                    evt.begin()?;
                }
                if let Some(previous) = st.cmd.take() {
                    previous.end()?;
                }
                let unit = PendingUnit::new(evt, cmd.name, cmd.arg);
                let summary = unit.summary();
                st.cmd = Some(unit);
                self.open_payload(st, dir, summary, size)?;
            }
            literal => {
                if literal == Literal::Invalid {
                    debug!("IMAP {} invalid literal length in command", self.conntrack);
                }
                if let Some(evt) = evt {
                    evt.process()?;
                }
            }
        }
        Ok(())
    }

    fn handle_response(&self, st: &mut ImapConntrack, dir: Direction, raw: &[u8], line: &str) -> Result<()> {
        if st.rsp.is_some() {
            return self.continue_response(st, dir, raw, line);
        }

        let Some(rsp) = parse_response(line) else {
            debug!("IMAP {} response without a space after its tag", self.conntrack);
            st.state = ImapState::Invalid;
            return Ok(());
        };

        let mut evt = self.alloc(&self.events.rsp);
        if let Some(evt) = evt.as_mut() {
            evt.set(RSP_TAG, Value::from(rsp.tag))?;
            evt.set(RSP_STATUS, Value::from(rsp.status))?;
            if let Some(text) = rsp.text {
                evt.set(RSP_TEXT, Value::from(text))?;
            }
        }

        match parse_literal(raw) {
            Literal::Size(size) => {
                if let Some(evt) = evt.as_mut() {
                    evt.begin()?;
                }
                let unit = PendingUnit::new(evt, rsp.status, rsp.text);
                let summary = unit.summary();
                st.rsp = Some(unit);
                self.open_payload(st, dir, summary, size)?;
            }
            literal => {
                if literal == Literal::Invalid {
                    debug!("IMAP {} invalid literal length in response", self.conntrack);
                }
                if let Some(evt) = evt {
                    evt.process()?;
                }
            }
        }

        self.server_transition(st, rsp.status, rsp.text.unwrap_or_default());
        Ok(())
    }

    /// Line following a drained server literal
    fn continue_response(&self, st: &mut ImapConntrack, dir: Direction, raw: &[u8], line: &str) -> Result<()> {
        let summary = match st.rsp.as_mut() {
            Some(unit) => {
                unit.append_text(line)?;
                unit.summary()
            }
            None => return Ok(()),
        };

        match parse_literal(raw) {
            Literal::Size(size) => self.open_payload(st, dir, summary, size)?,
            Literal::Invalid => {
                debug!("IMAP {} invalid literal length in continuation", self.conntrack);
                st.state = ImapState::Invalid;
                if let Some(unit) = st.rsp.take() {
                    unit.end()?;
                }
            }
            Literal::None => {
                if let Some(unit) = st.rsp.take() {
                    unit.end()?;
                }
            }
        }
        Ok(())
    }

    fn server_transition(&self, st: &mut ImapConntrack, status: &str, text: &str) {
        let ok = status.eq_ignore_ascii_case("OK");
        match st.state {
            ImapState::CompressRequested | ImapState::StartTlsRequested => {
                if ok {
                    self.activate(st);
                } else {
                    debug!("IMAP {} layer change refused: {} {}", self.conntrack, status, text);
                    st.state = ImapState::Normal;
                }
            }
            // Untagged acknowledgments are recognized by their text
            ImapState::Normal if ok => {
                if starts_with_ignore_case(text, "DEFLATE active") {
                    st.state = ImapState::CompressRequested;
                    self.activate(st);
                } else if starts_with_ignore_case(text, "Begin TLS negotiation now") {
                    st.state = ImapState::StartTlsRequested;
                    self.activate(st);
                }
            }
            _ => {}
        }
    }

    /// Complete a requested layer change
    fn activate(&self, st: &mut ImapConntrack) {
        match st.state {
            ImapState::CompressRequested => {
                st.state = ImapState::CompressActive;
                debug!("IMAP {} compression active", self.conntrack);
                self.decompress_init(st);
            }
            ImapState::StartTlsRequested => {
                st.state = ImapState::TlsActive;
                debug!("IMAP {} TLS active, inspection stops", self.conntrack);
                for parser in st.parsers.iter_mut() {
                    parser.empty();
                }
            }
            _ => {}
        }
    }

    /// Attach decoders to both directions and inflate what is already buffered
    fn decompress_init(&self, st: &mut ImapConntrack) {
        for d in 0..2 {
            let mut decoder = DeflateDecoder::new();
            if st.parsers[d].remaining_len() > 0 {
                match decode_growable(&mut decoder, st.parsers[d].remaining()) {
                    Ok(decoded) => st.parsers[d].replace_buffer(decoded),
                    Err(e) => {
                        debug!("IMAP {} unable to inflate buffered bytes: {}", self.conntrack, e);
                        st.state = ImapState::Invalid;
                        return;
                    }
                }
            }
            st.decoders[d] = Some(Box::new(decoder));
        }
    }

    fn inflate(&self, st: &mut ImapConntrack, dir: Direction, payload: &[u8]) -> Option<Vec<u8>> {
        let decoder = st.decoders[dir.index()].get_or_insert_with(|| Box::new(DeflateDecoder::new()));
        match decode_growable(decoder.as_mut(), payload) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                debug!("IMAP {} decoder failed: {}", self.conntrack, e);
                st.state = ImapState::Invalid;
                None
            }
        }
    }

    fn open_payload(&self, st: &mut ImapConntrack, dir: Direction, summary: String, size: u64) -> Result<()> {
        let d = dir.index();
        if let Some(previous) = st.pload[d].take() {
            previous.finish()?;
        }

        if let Some(mut evt) = self.alloc(&self.events.pload) {
            evt.set(PLOAD_CMD, Value::String(summary))?;
            evt.set(PLOAD_SIZE, Value::U64(size))?;
            evt.begin()?;
            st.pload[d] = Some(evt);
        }

        st.data_bytes[d] = size;
        if size == 0 {
            self.finish_payload(st, dir)?;
        }
        Ok(())
    }

    /// Feed buffered literal bytes to the payload event. Returns true once
    /// the whole literal went through.
    fn drain_payload(&self, st: &mut ImapConntrack, dir: Direction) -> Result<bool> {
        let d = dir.index();
        let avail = st.parsers[d].remaining_len() as u64;
        let wanted = st.data_bytes[d];

        if avail < wanted {
            if avail > 0 {
                if let Some(evt) = st.pload[d].as_mut() {
                    evt.update(st.parsers[d].remaining())?;
                }
            }
            st.data_bytes[d] -= avail;
            st.parsers[d].empty();
            return Ok(false);
        }

        let n = wanted as usize;
        if let Some(evt) = st.pload[d].as_mut() {
            evt.update(&st.parsers[d].remaining()[..n])?;
        }
        st.parsers[d].skip_bytes(n);
        st.data_bytes[d] = 0;
        self.finish_payload(st, dir)?;
        Ok(true)
    }

    /// End the payload event; a client command ends with its literal
    fn finish_payload(&self, st: &mut ImapConntrack, dir: Direction) -> Result<()> {
        if let Some(evt) = st.pload[dir.index()].take() {
            evt.end()?;
        }
        if !st.is_server(dir) {
            if let Some(unit) = st.cmd.take() {
                unit.end()?;
            }
        }
        Ok(())
    }
}
