//! Events and event kinds
//!
//! Protocols register named event kinds with a typed schema, then allocate
//! [`Event`]s, fill their data slots and drive them through
//! `begin` / `update` / `end`. Every transition is delivered synchronously
//! to the kind's listeners, in registration order.

pub mod listeners;
pub mod payload;
pub mod registry;

pub use listeners::{CollectListener, CollectedEvent, EventListener, JsonListener, LogListener};
pub use payload::PayloadBuffer;
pub use registry::EventRegistry;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{trace, warn};

use crate::conntrack::EntryId;
use crate::types::{Value, ValueType};

/// Version of the event registration interface
pub const EVENT_API_VERSION: u32 = 1;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event kind {name} built for API version {got}, expected {expected}")]
    ApiVersion { name: String, expected: u32, got: u32 },

    #[error("event kind {0} is already registered")]
    Duplicate(String),

    #[error("event kind {0} is not registered")]
    NotFound(String),

    #[error("listener {listener} is not registered on event {kind}")]
    ListenerNotFound { kind: String, listener: String },

    #[error("listeners notification of event {kind} failed: {source}")]
    Notify {
        kind: String,
        #[source]
        source: Box<crate::Error>,
    },

    #[error("listener {listener} failed to process event {event}: {source}")]
    Listener {
        listener: String,
        event: String,
        #[source]
        source: Box<crate::Error>,
    },

    #[error("event {kind} has no field {field}")]
    UnknownField { kind: String, field: String },

    #[error("field {field} of event {kind} is {expected}, got {got}")]
    TypeMismatch {
        kind: String,
        field: &'static str,
        expected: ValueType,
        got: ValueType,
    },

    #[error("event {0} already started")]
    AlreadyStarted(String),

    #[error("event {0} has not started")]
    NotStarted(String),

    #[error("cannot discard event {0}: processing already started")]
    DiscardStarted(String),
}

/// One slot of an event schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataItemReg {
    pub name: &'static str,
    pub value_type: ValueType,
}

impl DataItemReg {
    pub const fn new(name: &'static str, value_type: ValueType) -> Self {
        Self { name, value_type }
    }
}

/// Called with `true` when the first listener is added and `false` when
/// the last one is removed
pub type ListenersNotify = Arc<dyn Fn(bool) -> crate::Result<()> + Send + Sync>;

/// Registration request for an event kind
#[derive(Clone)]
pub struct EventKindInfo {
    pub api_ver: u32,
    pub name: &'static str,
    /// Protocol owning the kind
    pub source: &'static str,
    pub description: &'static str,
    pub data: Vec<DataItemReg>,
    pub listeners_notify: Option<ListenersNotify>,
}

impl EventKindInfo {
    pub fn new(name: &'static str, source: &'static str, description: &'static str) -> Self {
        Self {
            api_ver: EVENT_API_VERSION,
            name,
            source,
            description,
            data: Vec::new(),
            listeners_notify: None,
        }
    }

    pub fn with_data(mut self, data: &[DataItemReg]) -> Self {
        self.data = data.to_vec();
        self
    }

    pub fn with_notify(mut self, notify: ListenersNotify) -> Self {
        self.listeners_notify = Some(notify);
        self
    }
}

/// A registered event kind
pub struct EventKind {
    name: &'static str,
    source: &'static str,
    description: &'static str,
    data: Vec<DataItemReg>,
    listeners_notify: Option<ListenersNotify>,
    pub(crate) listeners: RwLock<Vec<Arc<dyn EventListener>>>,
    listener_count: AtomicUsize,
    allocated: AtomicU64,
}

impl EventKind {
    pub(crate) fn new(info: EventKindInfo) -> Self {
        Self {
            name: info.name,
            source: info.source,
            description: info.description,
            data: info.data,
            listeners_notify: info.listeners_notify,
            listeners: RwLock::new(Vec::new()),
            listener_count: AtomicUsize::new(0),
            allocated: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    pub fn description(&self) -> &'static str {
        self.description
    }

    pub fn data(&self) -> &[DataItemReg] {
        &self.data
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.data.iter().position(|d| d.name == name)
    }

    /// Cheap check used to skip building events nobody listens to
    pub fn has_listeners(&self) -> bool {
        self.listener_count.load(Ordering::Acquire) > 0
    }

    pub fn listener_count(&self) -> usize {
        self.listener_count.load(Ordering::Acquire)
    }

    /// Number of events allocated for this kind so far
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub(crate) fn notify(&self, has_listeners: bool) -> Result<(), EventError> {
        match &self.listeners_notify {
            Some(notify) => notify(has_listeners).map_err(|e| EventError::Notify {
                kind: self.name.to_string(),
                source: Box::new(e),
            }),
            None => Ok(()),
        }
    }

    pub(crate) fn set_listener_count(&self, count: usize) {
        self.listener_count.store(count, Ordering::Release);
    }

    fn snapshot_listeners(&self) -> Vec<Arc<dyn EventListener>> {
        self.listeners.read().clone()
    }
}

impl std::fmt::Debug for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventKind")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Allocated,
    Started,
    Ended,
}

/// One occurrence of an event kind
pub struct Event {
    id: u64,
    kind: Arc<EventKind>,
    data: Vec<Option<Value>>,
    ts: DateTime<Utc>,
    conntrack: Option<EntryId>,
    state: EventState,
}

impl Event {
    /// Allocate an unstarted event with empty data slots
    pub fn alloc(kind: &Arc<EventKind>) -> Self {
        kind.allocated.fetch_add(1, Ordering::Relaxed);
        Self {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            kind: Arc::clone(kind),
            data: vec![None; kind.data.len()],
            ts: Utc::now(),
            conntrack: None,
            state: EventState::Allocated,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &Arc<EventKind> {
        &self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.ts
    }

    pub fn set_timestamp(&mut self, ts: DateTime<Utc>) {
        self.ts = ts;
    }

    pub fn conntrack(&self) -> Option<EntryId> {
        self.conntrack
    }

    pub fn set_conntrack(&mut self, id: EntryId) {
        self.conntrack = Some(id);
    }

    pub fn state(&self) -> EventState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.state == EventState::Started
    }

    /// Set a data slot by index, checking it against the schema
    pub fn set(&mut self, index: usize, value: Value) -> Result<(), EventError> {
        let Some(reg) = self.kind.data.get(index) else {
            return Err(EventError::UnknownField {
                kind: self.kind.name.to_string(),
                field: index.to_string(),
            });
        };
        if value.value_type() != reg.value_type {
            return Err(EventError::TypeMismatch {
                kind: self.kind.name.to_string(),
                field: reg.name,
                expected: reg.value_type,
                got: value.value_type(),
            });
        }
        self.data[index] = Some(value);
        Ok(())
    }

    pub fn set_by_name(&mut self, name: &str, value: Value) -> Result<(), EventError> {
        let index = self.kind.field_index(name).ok_or_else(|| EventError::UnknownField {
            kind: self.kind.name.to_string(),
            field: name.to_string(),
        })?;
        self.set(index, value)
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.data.get(index)?.as_ref()
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.get(self.kind.field_index(name)?)
    }

    /// (name, value) pairs of the schema, unset slots included
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, Option<&Value>)> {
        self.kind
            .data
            .iter()
            .zip(self.data.iter())
            .map(|(reg, v)| (reg.name, v.as_ref()))
    }

    /// JSON object of the event and its set fields
    pub fn to_json(&self) -> serde_json::Value {
        let data: serde_json::Map<String, serde_json::Value> = self
            .fields()
            .filter_map(|(name, v)| Some((name.to_string(), serde_json::to_value(v?).ok()?)))
            .collect();

        serde_json::json!({
            "event": self.kind.name,
            "source": self.kind.source,
            "ts": self.ts.to_rfc3339(),
            "conntrack": self.conntrack.map(|id| id.as_u64()),
            "data": data,
        })
    }

    /// Mark the event started and deliver it to `process_begin` listeners
    pub fn begin(&mut self) -> Result<(), EventError> {
        if self.state != EventState::Allocated {
            return Err(EventError::AlreadyStarted(self.kind.name.to_string()));
        }
        self.state = EventState::Started;
        trace!("Event {} ({}) started", self.kind.name, self.id);

        for listener in self.kind.snapshot_listeners() {
            listener
                .process_begin(self)
                .map_err(|e| self.listener_error(listener.name(), e))?;
        }
        Ok(())
    }

    /// Deliver an additional chunk of a started event
    pub fn update(&mut self, chunk: &[u8]) -> Result<(), EventError> {
        if self.state != EventState::Started {
            return Err(EventError::NotStarted(self.kind.name.to_string()));
        }
        for listener in self.kind.snapshot_listeners() {
            listener
                .process_update(self, chunk)
                .map_err(|e| self.listener_error(listener.name(), e))?;
        }
        Ok(())
    }

    /// Finalize the event and dispatch it to every listener
    pub fn end(mut self) -> Result<(), EventError> {
        if self.state != EventState::Started {
            let name = self.kind.name.to_string();
            self.state = EventState::Ended;
            return Err(EventError::NotStarted(name));
        }
        self.state = EventState::Ended;
        trace!("Event {} ({}) ended", self.kind.name, self.id);

        for listener in self.kind.snapshot_listeners() {
            listener
                .process_end(&self)
                .map_err(|e| self.listener_error(listener.name(), e))?;
        }
        Ok(())
    }

    /// Begin and end in one go
    pub fn process(mut self) -> Result<(), EventError> {
        self.begin()?;
        self.end()
    }

    /// Drop an unstarted event. A started one is ended first so listeners
    /// still see its end, and the refusal is reported.
    pub fn discard(self) -> Result<(), EventError> {
        if self.state == EventState::Started {
            let name = self.kind.name.to_string();
            self.end()?;
            return Err(EventError::DiscardStarted(name));
        }
        Ok(())
    }

    /// End a started event, discard an unstarted one
    pub fn finish(self) -> Result<(), EventError> {
        match self.state {
            EventState::Started => self.end(),
            _ => self.discard(),
        }
    }

    fn listener_error(&self, listener: &str, source: crate::Error) -> EventError {
        EventError::Listener {
            listener: listener.to_string(),
            event: self.kind.name.to_string(),
            source: Box::new(source),
        }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if self.state == EventState::Started {
            warn!(
                "Event {} ({}) released while still in progress",
                self.kind.name, self.id
            );
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("kind", &self.kind.name)
            .field("state", &self.state)
            .field("data", &self.data)
            .finish()
    }
}
