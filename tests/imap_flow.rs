//! IMAP flows driven through the engine end to end

use std::io::Write;
use std::sync::Arc;

use flate2::write::DeflateEncoder;
use flate2::Compression;
use flowscope::conntrack::ConntrackEntry;
use flowscope::core::{Direction, StreamSegment};
use flowscope::event::CollectListener;
use flowscope::protocols::imap::{IMAP_CMD, IMAP_PLOAD, IMAP_RSP};
use flowscope::transcript::{Sender, Transcript};
use flowscope::{Config, Engine, Error, ProcessStatus};

struct Session {
    engine: Engine,
    flow: Arc<ConntrackEntry>,
    collect: Arc<CollectListener>,
}

impl Session {
    fn new() -> Self {
        let session = Self::unobserved();
        for kind in [IMAP_CMD, IMAP_RSP, IMAP_PLOAD] {
            session.engine.events().listen(kind, session.collect.clone()).unwrap();
        }
        session
    }

    /// No listener attached to any IMAP event
    fn unobserved() -> Self {
        let engine = Engine::with_builtin_protocols(Config::default()).unwrap();
        let flow = engine.track_transport(50000, 143).unwrap();
        Self {
            engine,
            flow,
            collect: Arc::new(CollectListener::new("collect")),
        }
    }

    fn send(&self, dir: Direction, data: &[u8]) -> ProcessStatus {
        let seg = StreamSegment::new(Some(self.flow.clone()), dir, data);
        self.engine.process_stream("imap", &seg).unwrap()
    }

    fn client(&self, data: &[u8]) -> ProcessStatus {
        self.send(Direction::Forward, data)
    }

    fn server(&self, data: &[u8]) -> ProcessStatus {
        self.send(Direction::Reverse, data)
    }

    fn replay(&self, transcript: &str) -> ProcessStatus {
        let transcript = Transcript::parse(transcript).unwrap();
        let mut status = ProcessStatus::Ok;
        for step in transcript.steps() {
            status = self.send(step.sender.direction(), &step.data);
        }
        status
    }
}

/// Raw DEFLATE with a sync flush, as a peer writes it after COMPRESS
fn deflate(data: &[u8]) -> Vec<u8> {
    let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.flush().unwrap();
    enc.get_ref().clone()
}

#[test]
fn test_login_exchange() {
    let s = Session::new();
    assert_eq!(s.server(b"* OK IMAP4rev1 ready\r\n"), ProcessStatus::Ok);
    assert_eq!(s.client(b"a001 LOGIN user secret\r\n"), ProcessStatus::Ok);
    assert_eq!(s.server(b"a001 OK LOGIN completed\r\n"), ProcessStatus::Ok);

    let cmds = s.collect.events_of(IMAP_CMD);
    assert_eq!(cmds.len(), 1);
    assert_eq!(cmds[0].field("tag"), Some("a001"));
    assert_eq!(cmds[0].field("name"), Some("LOGIN"));
    assert_eq!(cmds[0].field("arg"), Some("user secret"));

    let rsps = s.collect.events_of(IMAP_RSP);
    assert_eq!(rsps.len(), 2);
    assert_eq!(rsps[0].field("tag"), Some("*"));
    assert_eq!(rsps[0].field("text"), Some("IMAP4rev1 ready"));
    assert_eq!(rsps[1].field("status"), Some("OK"));
    assert_eq!(rsps[1].field("text"), Some("LOGIN completed"));

    // One IMAP entry below the transport flow
    let imap = s.engine.table("imap").unwrap();
    assert_eq!(imap.len(), 1);
    assert_eq!(imap.entries()[0].parent_id(), Some(s.flow.id()));
    assert_eq!(s.flow.child_count(), 1);
}

#[test]
fn test_server_literal() {
    let s = Session::new();
    s.server(b"* OK ready\r\n");
    s.client(b"a002 FETCH 1 BODY[]\r\n");
    s.server(b"* 1 FETCH (BODY[] {5}\r\nhello)\r\n");
    s.server(b"a002 OK FETCH completed\r\n");

    let plds = s.collect.events_of(IMAP_PLOAD);
    assert_eq!(plds.len(), 1);
    assert_eq!(plds[0].payload, b"hello");
    assert_eq!(plds[0].field_u64("size"), Some(5));
    assert_eq!(plds[0].field("cmd"), Some("1 FETCH (BODY[] {5}"));

    let rsps = s.collect.events_of(IMAP_RSP);
    assert_eq!(rsps.len(), 3);
    assert_eq!(rsps[1].field("status"), Some("1"));
    assert_eq!(rsps[1].field("text"), Some("FETCH (BODY[] {5})"));
    assert_eq!(rsps[2].field("tag"), Some("a002"));

    // The payload ends before the response holding it
    let order: Vec<&str> = s.collect.events().iter().map(|e| e.kind).collect();
    assert_eq!(order, vec![IMAP_RSP, IMAP_CMD, IMAP_PLOAD, IMAP_RSP, IMAP_RSP]);
}

#[test]
fn test_literal_split_across_segments() {
    let s = Session::new();
    s.server(b"* OK ready\r\n");
    assert_eq!(s.server(b"* 1 FETCH (BODY[] {11}\r\nhel"), ProcessStatus::WantMore);
    assert_eq!(s.collect.in_flight(), 2);
    assert_eq!(s.server(b"lo wo"), ProcessStatus::WantMore);
    s.server(b"rld)\r\n");

    let plds = s.collect.events_of(IMAP_PLOAD);
    assert_eq!(plds.len(), 1);
    assert_eq!(plds[0].payload, b"hello world");
    assert_eq!(plds[0].updates, 3);
    assert_eq!(s.collect.in_flight(), 0);
}

#[test]
fn test_client_literal() {
    let s = Session::new();
    s.server(b"* OK ready\r\n");
    s.client(b"a003 APPEND INBOX {5}\r\n");
    assert!(s.collect.events_of(IMAP_CMD).is_empty());
    s.client(b"hello\r\n");
    s.client(b"a004 NOOP\r\n");

    let cmds = s.collect.events_of(IMAP_CMD);
    assert_eq!(cmds.len(), 2);
    assert_eq!(cmds[0].field("arg"), Some("INBOX {5}"));
    assert_eq!(cmds[1].field("name"), Some("NOOP"));
    let plds = s.collect.events_of(IMAP_PLOAD);
    assert_eq!(plds[0].field("cmd"), Some("APPEND INBOX {5}"));
    assert_eq!(plds[0].payload, b"hello");
}

#[test]
fn test_zero_length_literal() {
    let s = Session::new();
    s.server(b"* OK ready\r\n");
    s.client(b"a005 APPEND INBOX {0}\r\n");
    s.client(b"\r\n");

    let plds = s.collect.events_of(IMAP_PLOAD);
    assert_eq!(plds.len(), 1);
    assert!(plds[0].payload.is_empty());
    assert_eq!(s.collect.events_of(IMAP_CMD).len(), 1);
}

#[test]
fn test_compress_deflate() {
    let s = Session::new();
    let status = s.replay(
        "S: * OK ready\n\
         C: a001 COMPRESS DEFLATE\n\
         S: a001 OK DEFLATE active\n\
         !deflate\n\
         C: a002 SELECT INBOX\n\
         S: * 3 EXISTS\n\
         S: a002 OK SELECT completed\n",
    );
    assert_eq!(status, ProcessStatus::Ok);

    let cmds = s.collect.events_of(IMAP_CMD);
    assert_eq!(cmds.len(), 2);
    assert_eq!(cmds[1].field("name"), Some("SELECT"));
    assert_eq!(cmds[1].field("arg"), Some("INBOX"));

    let rsps = s.collect.events_of(IMAP_RSP);
    assert_eq!(rsps.len(), 4);
    assert_eq!(rsps[2].field("text"), Some("EXISTS"));
    assert_eq!(rsps[3].field("text"), Some("SELECT completed"));
}

#[test]
fn test_compress_refused() {
    let s = Session::new();
    s.replay(
        "S: * OK ready\n\
         C: a001 COMPRESS DEFLATE\n\
         S: a001 NO compression unavailable\n\
         C: a002 NOOP\n",
    );
    let cmds = s.collect.events_of(IMAP_CMD);
    assert_eq!(cmds.len(), 2);
    assert_eq!(cmds[1].field("name"), Some("NOOP"));
}

#[test]
fn test_starttls_stops_inspection() {
    let s = Session::new();
    s.server(b"* OK ready\r\n");
    s.client(b"a001 STARTTLS\r\n");
    assert_eq!(s.server(b"a001 OK Begin TLS negotiation now\r\n"), ProcessStatus::Stop);

    let seen = s.collect.len();
    assert_eq!(s.client(b"\x16\x03\x01\x00\xa5\x01\x00"), ProcessStatus::Stop);
    assert_eq!(s.server(b"a002 OK looks like text\r\n"), ProcessStatus::Stop);
    assert_eq!(s.collect.len(), seen);
}

#[test]
fn test_starttls_without_acknowledgment() {
    let s = Session::new();
    s.server(b"* OK ready\r\n");
    s.client(b"a001 STARTTLS\r\n");
    // Client goes straight to the handshake
    assert_eq!(s.client(b"\x16\x03\x01\x00\xa5\x01\x00"), ProcessStatus::Stop);
    assert_eq!(s.collect.events_of(IMAP_CMD).len(), 1);
}

#[test]
fn test_layer_change_not_taken() {
    let s = Session::new();
    s.server(b"* OK ready\r\n");
    s.client(b"a001 STARTTLS\r\n");
    // Plain IMAP from the client cancels the request
    assert_eq!(s.client(b"a002 NOOP\r\n"), ProcessStatus::Ok);
    assert_eq!(s.server(b"a002 OK NOOP completed\r\n"), ProcessStatus::Ok);
    assert_eq!(s.collect.events_of(IMAP_CMD).len(), 2);
}

#[test]
fn test_untagged_deflate_acknowledgment() {
    let s = Session::new();
    s.replay(
        "S: * OK ready\n\
         S: * OK DEFLATE active\n\
         !deflate\n\
         C: a001 NOOP\n",
    );
    let cmds = s.collect.events_of(IMAP_CMD);
    assert_eq!(cmds.len(), 1);
    assert_eq!(cmds[0].field("tag"), Some("a001"));
}

#[test]
fn test_no_listeners_no_events() {
    let s = Session::unobserved();
    s.server(b"* OK ready\r\n");
    s.client(b"a001 LOGIN user secret\r\n");
    s.server(b"* 1 FETCH (BODY[] {5}\r\nhello)\r\n");
    s.client(b"a002 STARTTLS\r\n");
    // State machine keeps running without anyone listening
    assert_eq!(s.server(b"a002 OK Begin TLS negotiation now\r\n"), ProcessStatus::Stop);

    for name in [IMAP_CMD, IMAP_RSP, IMAP_PLOAD] {
        let kind = s.engine.events().get_by_name(name).unwrap();
        assert!(!kind.has_listeners());
        assert_eq!(kind.allocated(), 0);
    }
}

#[test]
fn test_listener_attached_mid_flow() {
    let s = Session::unobserved();
    s.server(b"* OK ready\r\n");
    s.client(b"a001 NOOP\r\n");
    let cmd = s.engine.events().get_by_name(IMAP_CMD).unwrap();
    assert_eq!(cmd.allocated(), 0);

    s.engine.events().listen(IMAP_CMD, s.collect.clone()).unwrap();
    s.client(b"a002 NOOP\r\n");
    s.server(b"a002 OK done\r\n");

    assert_eq!(cmd.allocated(), 1);
    let cmds = s.collect.events_of(IMAP_CMD);
    assert_eq!(cmds.len(), 1);
    assert_eq!(cmds[0].field("tag"), Some("a002"));
    // Responses still have nobody listening
    let rsp = s.engine.events().get_by_name(IMAP_RSP).unwrap();
    assert_eq!(rsp.allocated(), 0);
    assert_eq!(s.collect.len(), 1);
}

#[test]
fn test_compressed_bytes_behind_request() {
    let s = Session::new();
    s.server(b"* OK ready\r\n");

    // No server OK in between: compressed data follows in the same segment
    let mut seg = b"a001 COMPRESS DEFLATE\r\n".to_vec();
    seg.extend(deflate(b"a002 SELECT 650b61810024\r\n"));
    assert_eq!(s.client(&seg), ProcessStatus::Ok);

    let cmds = s.collect.events_of(IMAP_CMD);
    assert_eq!(cmds.len(), 2);
    assert_eq!(cmds[0].field("name"), Some("COMPRESS"));
    assert_eq!(cmds[1].field("tag"), Some("a002"));
    assert_eq!(cmds[1].field("name"), Some("SELECT"));
    assert_eq!(cmds[1].field("arg"), Some("650b61810024"));
}

#[test]
fn test_missing_space_invalidates() {
    let s = Session::new();
    assert_eq!(s.client(b"a001NOOP\r\n"), ProcessStatus::Stop);
    assert_eq!(s.client(b"a002 NOOP\r\n"), ProcessStatus::Stop);
    assert!(s.collect.is_empty());
}

#[test]
fn test_invalid_literal_in_continuation() {
    let s = Session::new();
    s.server(b"* OK ready\r\n");
    s.server(b"* 1 FETCH (BODY[] {2}\r\nab BODY[1] {x}\r\n");
    assert_eq!(s.server(b"a001 OK done\r\n"), ProcessStatus::Stop);
    // The held response still ended
    assert_eq!(s.collect.in_flight(), 0);
    assert_eq!(s.collect.events_of(IMAP_RSP).len(), 2);
}

#[test]
fn test_blank_lines_ignored() {
    let s = Session::new();
    s.server(b"* OK ready\r\n");
    s.client(b"\r\n\r\na001 NOOP\r\n");
    assert_eq!(s.collect.events_of(IMAP_CMD).len(), 1);
}

#[test]
fn test_teardown_ends_started_events() {
    let s = Session::new();
    s.server(b"* OK ready\r\n");
    assert_eq!(s.client(b"a001 APPEND INBOX {10}\r\nhel"), ProcessStatus::WantMore);
    assert_eq!(s.collect.in_flight(), 2);

    s.flow.cleanup().unwrap();

    assert_eq!(s.collect.in_flight(), 0);
    let plds = s.collect.events_of(IMAP_PLOAD);
    assert_eq!(plds.len(), 1);
    assert_eq!(plds[0].payload, b"hel");
    assert_eq!(s.collect.events_of(IMAP_CMD).len(), 1);
    assert!(s.engine.table("imap").unwrap().is_empty());
}

#[test]
fn test_shutdown_ends_started_events() {
    let s = Session::new();
    s.server(b"* OK ready\r\n");
    s.server(b"* 1 FETCH (BODY[] {100}\r\npartial");
    s.engine.shutdown().unwrap();
    assert_eq!(s.collect.in_flight(), 0);
    assert_eq!(s.collect.begun(), s.collect.len());
}

#[test]
fn test_segment_without_parent() {
    let s = Session::new();
    let seg = StreamSegment::new(None, Direction::Forward, b"a001 NOOP\r\n");
    let err = s.engine.process_stream("imap", &seg).unwrap_err();
    assert!(matches!(err, Error::Protocol { proto: "imap", .. }));
}

#[test]
fn test_first_line_decides_server() {
    // Client greets first on the reverse direction
    let s = Session::new();
    s.send(Direction::Reverse, b"a001 CAPABILITY\r\n");
    s.send(Direction::Forward, b"* CAPABILITY IMAP4rev1\r\n");
    assert_eq!(s.collect.events_of(IMAP_CMD).len(), 1);
    assert_eq!(s.collect.events_of(IMAP_RSP).len(), 1);
    assert_eq!(Sender::Client.direction(), Direction::Forward);
}

#[test]
fn test_demo_transcripts() {
    let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("demos");

    let s = Session::new();
    let session = Transcript::from_file(dir.join("imap_session.txt")).unwrap();
    for step in session.steps() {
        s.send(step.sender.direction(), &step.data);
    }
    let plds = s.collect.events_of(IMAP_PLOAD);
    assert_eq!(plds.len(), 1);
    assert_eq!(plds[0].payload, b"Subject: hello\r\n");
    assert_eq!(s.collect.events_of(IMAP_CMD).len(), 5);
    assert_eq!(s.collect.in_flight(), 0);

    let s = Session::new();
    let tls = Transcript::from_file(dir.join("imap_starttls.txt")).unwrap();
    let last = tls
        .steps()
        .iter()
        .map(|step| s.send(step.sender.direction(), &step.data))
        .last();
    assert_eq!(last, Some(ProcessStatus::Stop));
}
