//! Engine shared between threads and the async timer driver

use std::sync::Arc;
use std::time::Duration;

use flowscope::core::{Direction, StreamSegment};
use flowscope::event::CollectListener;
use flowscope::protocols::imap::{IMAP_CMD, IMAP_RSP};
use flowscope::{Config, Engine, Value};

const WORKERS: u16 = 8;
const FLOWS_PER_WORKER: u16 = 50;

fn engine_with_collector() -> (Engine, Arc<CollectListener>) {
    let engine = Engine::with_builtin_protocols(Config::default()).unwrap();
    let collect = Arc::new(CollectListener::new("collect"));
    engine.events().listen(IMAP_CMD, collect.clone()).unwrap();
    engine.events().listen(IMAP_RSP, collect.clone()).unwrap();
    (engine, collect)
}

#[test]
fn test_parallel_sessions() {
    let (engine, collect) = engine_with_collector();

    std::thread::scope(|scope| {
        for worker in 0..WORKERS {
            let engine = &engine;
            scope.spawn(move || {
                for n in 0..FLOWS_PER_WORKER {
                    let port = 10_000 + worker * FLOWS_PER_WORKER + n;
                    let flow = engine.track_transport(port, 143).unwrap();
                    for (dir, data) in [
                        (Direction::Reverse, &b"* OK ready\r\n"[..]),
                        (Direction::Forward, &b"a001 NOOP\r\n"[..]),
                        (Direction::Reverse, &b"a001 OK done\r\n"[..]),
                    ] {
                        let seg = StreamSegment::new(Some(flow.clone()), dir, data);
                        engine.process_stream("imap", &seg).unwrap();
                    }
                }
            });
        }
    });

    let flows = (WORKERS * FLOWS_PER_WORKER) as usize;
    assert_eq!(engine.transport_table().len(), flows);
    assert_eq!(engine.table("imap").unwrap().len(), flows);
    assert_eq!(collect.events_of(IMAP_CMD).len(), flows);
    assert_eq!(collect.events_of(IMAP_RSP).len(), flows * 2);

    engine.shutdown().unwrap();
    assert!(engine.transport_table().is_empty());
}

#[test]
fn test_both_directions_share_entry() {
    let engine = Engine::with_builtin_protocols(Config::default()).unwrap();
    let table = engine.transport_table().clone();

    std::thread::scope(|scope| {
        for worker in 0..WORKERS {
            let table = &table;
            scope.spawn(move || {
                for port in 0..FLOWS_PER_WORKER {
                    // Half the workers look the flows up from the other side
                    let (fwd, rev) = if worker % 2 == 0 { (port, 143) } else { (143, port) };
                    table
                        .get_or_create(&Value::U16(fwd), Some(&Value::U16(rev)), None)
                        .unwrap();
                }
            });
        }
    });

    assert_eq!(table.len(), FLOWS_PER_WORKER as usize);
    for ce in table.entries() {
        assert_eq!(table.index_count(ce.id()), (1, 1));
    }
}

#[tokio::test]
async fn test_timer_driver_expires_flows() {
    let mut config = Config::default();
    config.conntrack.transport_timeout_secs = 1;
    let engine = Engine::with_builtin_protocols(config).unwrap();
    let collect = Arc::new(CollectListener::new("collect"));
    engine.events().listen(IMAP_CMD, collect.clone()).unwrap();

    let flow = engine.track_transport(40000, 143).unwrap();
    let seg = StreamSegment::new(Some(flow.clone()), Direction::Forward, b"a001 APPEND INBOX {4}\r\n");
    engine.process_stream("imap", &seg).unwrap();
    assert_eq!(collect.in_flight(), 1);

    let driver = engine.spawn_timer_driver(Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(1500)).await;
    driver.abort();

    assert!(flow.is_destroyed());
    assert!(engine.transport_table().is_empty());
    assert!(engine.table("imap").unwrap().is_empty());
    // Teardown ended the command waiting for its literal
    assert_eq!(collect.in_flight(), 0);
    assert_eq!(collect.events_of(IMAP_CMD).len(), 1);
}
