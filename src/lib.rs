//! flowscope - connection tracking and stateful stream-protocol analysis
//!
//! Transport flows are tracked in hash-indexed conntrack tables, application
//! protocols hang their own entries off those flows, and analyzers publish
//! typed events to registered listeners.
//!
//! # Modules
//!
//! - [`conntrack`]: bidirectional flow tables with parent/child cascading
//! - [`event`]: event kinds, listener dispatch and payload collection
//! - [`protocols`]: protocol registration and the IMAP analyzer
//! - [`engine`]: process-wide context wiring all of the above together

pub mod config;
pub mod conntrack;
pub mod core;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod event;
pub mod protocols;
pub mod stream;
pub mod timer;
pub mod transcript;
pub mod types;

pub use config::Config;
pub use conntrack::{ConntrackEntry, ConntrackTable};
pub use core::{Direction, StreamSegment};
pub use engine::Engine;
pub use error::{Error, Result};
pub use event::{Event, EventKind, EventListener, EventRegistry};
pub use protocols::{ProcessStatus, Protocol, ProtocolRegistration};
pub use timer::TimerQueue;
pub use types::{Value, ValueType};
