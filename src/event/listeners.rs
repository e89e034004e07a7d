//! Event listeners

use std::collections::HashMap;
use std::io::Write;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use super::payload::PayloadBuffer;
use super::Event;

/// Consumer of events of one or more kinds
///
/// Callbacks run synchronously on the thread processing the stream.
pub trait EventListener: Send + Sync {
    fn name(&self) -> &str;

    /// The event started; fields may still change
    fn process_begin(&self, _evt: &Event) -> crate::Result<()> {
        Ok(())
    }

    /// A chunk of payload belonging to a started event
    fn process_update(&self, _evt: &Event, _chunk: &[u8]) -> crate::Result<()> {
        Ok(())
    }

    /// The event is final
    fn process_end(&self, evt: &Event) -> crate::Result<()>;
}

/// Logs every ended event
pub struct LogListener {
    name: String,
}

impl LogListener {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl EventListener for LogListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_end(&self, evt: &Event) -> crate::Result<()> {
        let fields: Vec<String> = evt
            .fields()
            .filter_map(|(name, v)| Some(format!("{}={}", name, v?)))
            .collect();
        info!("{} {}", evt.name(), fields.join(" "));
        Ok(())
    }
}

/// Writes one JSON object per ended event
pub struct JsonListener<W: Write + Send> {
    name: String,
    out: Mutex<W>,
}

impl<W: Write + Send> JsonListener<W> {
    pub fn new(name: impl Into<String>, out: W) -> Self {
        Self {
            name: name.into(),
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write + Send> EventListener for JsonListener<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_end(&self, evt: &Event) -> crate::Result<()> {
        let line = evt.to_json().to_string();
        let mut out = self.out.lock();
        writeln!(out, "{}", line)?;
        Ok(())
    }
}

/// An ended event as seen by [`CollectListener`]
#[derive(Debug, Clone, Serialize)]
pub struct CollectedEvent {
    pub kind: &'static str,
    pub data: serde_json::Value,
    /// Concatenated update chunks
    pub payload: Vec<u8>,
    /// Number of update calls
    pub updates: usize,
}

impl CollectedEvent {
    /// String field of the event data
    pub fn field(&self, name: &str) -> Option<&str> {
        self.data.get(name)?.as_str()
    }

    pub fn field_u64(&self, name: &str) -> Option<u64> {
        self.data.get(name)?.as_u64()
    }
}

#[derive(Default)]
struct CollectInner {
    ended: Vec<CollectedEvent>,
    /// Payload of started events, by event id
    in_flight: HashMap<u64, (PayloadBuffer, usize)>,
    begun: usize,
}

/// Keeps every ended event in arrival order
pub struct CollectListener {
    name: String,
    inner: Mutex<CollectInner>,
}

impl CollectListener {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(CollectInner::default()),
        }
    }

    pub fn events(&self) -> Vec<CollectedEvent> {
        self.inner.lock().ended.clone()
    }

    pub fn events_of(&self, kind: &str) -> Vec<CollectedEvent> {
        self.inner
            .lock()
            .ended
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ended.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events begun but not yet ended
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    pub fn begun(&self) -> usize {
        self.inner.lock().begun
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.ended.clear();
        inner.in_flight.clear();
        inner.begun = 0;
    }
}

impl EventListener for CollectListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_begin(&self, evt: &Event) -> crate::Result<()> {
        let expected = evt
            .get_by_name("size")
            .and_then(|v| v.as_u64())
            .map(|s| s as usize);
        let mut inner = self.inner.lock();
        inner.begun += 1;
        inner.in_flight.insert(evt.id(), (PayloadBuffer::new(expected), 0));
        Ok(())
    }

    fn process_update(&self, evt: &Event, chunk: &[u8]) -> crate::Result<()> {
        let mut inner = self.inner.lock();
        if let Some((buf, updates)) = inner.in_flight.get_mut(&evt.id()) {
            buf.append(chunk);
            *updates += 1;
        }
        Ok(())
    }

    fn process_end(&self, evt: &Event) -> crate::Result<()> {
        let mut inner = self.inner.lock();
        let (payload, updates) = inner
            .in_flight
            .remove(&evt.id())
            .map(|(buf, updates)| (buf.into_inner(), updates))
            .unwrap_or_default();
        let data = evt.to_json()["data"].take();
        inner.ended.push(CollectedEvent {
            kind: evt.name(),
            data,
            payload,
            updates,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::event::{DataItemReg, EventKind, EventKindInfo};
    use crate::types::{Value, ValueType};

    fn kind() -> Arc<EventKind> {
        let kind = EventKind::new(
            EventKindInfo::new("pload", "test", "")
                .with_data(&[DataItemReg::new("size", ValueType::U64)]),
        );
        Arc::new(kind)
    }

    #[test]
    fn test_collect_payload_chunks() {
        let kind = kind();
        let collect = Arc::new(CollectListener::new("collect"));
        kind.listeners.write().push(collect.clone());

        let mut evt = Event::alloc(&kind);
        evt.set(0, Value::U64(5)).unwrap();
        evt.begin().unwrap();
        evt.update(b"hel").unwrap();
        evt.update(b"lo+extra").unwrap();
        assert_eq!(collect.in_flight(), 1);
        evt.end().unwrap();

        let events = collect.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, b"hello");
        assert_eq!(events[0].updates, 2);
        assert_eq!(events[0].field_u64("size"), Some(5));
        assert_eq!(collect.in_flight(), 0);
    }

    #[test]
    fn test_json_lines() {
        let kind = kind();
        let json = Arc::new(JsonListener::new("json", Vec::new()));
        kind.listeners.write().push(json.clone());

        let mut evt = Event::alloc(&kind);
        evt.set(0, Value::U64(1)).unwrap();
        evt.process().unwrap();
        drop(kind);

        let out = Arc::try_unwrap(json).ok().unwrap().into_inner();
        let line: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(line["event"], "pload");
        assert_eq!(line["data"]["size"], 1);
    }
}
