//! Analysis engine
//!
//! Process-wide context owning the timer queue, the event registry, the
//! transport conntrack table and every registered protocol with its table.
//!
//! # Architecture
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//! │  Transport  │────▶│   Protocol   │────▶│    Event     │
//! │  conntrack  │     │   analyzer   │     │   listeners  │
//! └─────────────┘     └──────────────┘     └──────────────┘
//!        ▲                   │
//!        │                   ▼
//! ┌─────────────┐     ┌──────────────┐
//! │ Timer queue │────▶│  child flow  │
//! │  (expiry)   │     │   teardown   │
//! └─────────────┘     └──────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::conntrack::{ConntrackEntry, ConntrackTable, TableStats};
use crate::core::StreamSegment;
use crate::event::EventRegistry;
use crate::protocols::{
    ProcessContext, ProcessStatus, ProtocolInit, ProtocolRegistration, ProtocolRegistry,
    RegisteredProtocol,
};
use crate::timer::TimerQueue;
use crate::types::Value;
use crate::{Error, Result};

/// Name of the transport conntrack table
pub const TRANSPORT_PROTO: &str = "tcp";

/// Engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub transport: TableStats,
    pub protocols: Vec<(String, TableStats)>,
    pub timers_pending: usize,
    pub timers_fired: u64,
    pub event_kinds: usize,
}

pub struct Engine {
    config: Config,
    timers: Arc<TimerQueue>,
    events: Arc<EventRegistry>,
    transport: Arc<ConntrackTable>,
    protocols: RwLock<ProtocolRegistry>,
    shut_down: AtomicBool,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let timers = Arc::new(TimerQueue::new());
        let transport = ConntrackTable::new(
            TRANSPORT_PROTO,
            config.conntrack.transport_table_size,
            true,
            Arc::clone(&timers),
        )?;

        info!(
            "Engine ready (transport table size {})",
            config.conntrack.transport_table_size
        );

        Ok(Self {
            config,
            timers,
            events: Arc::new(EventRegistry::new()),
            transport,
            protocols: RwLock::new(ProtocolRegistry::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Engine with every built-in protocol registered
    pub fn with_builtin_protocols(config: Config) -> Result<Self> {
        let engine = Self::new(config)?;
        for reg in crate::protocols::builtin_protocols() {
            engine.register_protocol(reg)?;
        }
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.events
    }

    pub fn timers(&self) -> &Arc<TimerQueue> {
        &self.timers
    }

    pub fn transport_table(&self) -> &Arc<ConntrackTable> {
        &self.transport
    }

    /// Allocate the protocol's table and instantiate it
    pub fn register_protocol(&self, reg: ProtocolRegistration) -> Result<()> {
        let mut protocols = self.protocols.write();
        if protocols.contains(reg.name) {
            return Err(Error::DuplicateProtocol(reg.name.to_string()));
        }

        let size = self
            .config
            .conntrack
            .table_size_for(reg.name)
            .unwrap_or(reg.ct_info.default_table_size);
        let table = ConntrackTable::new(reg.name, size, reg.ct_info.has_reverse, Arc::clone(&self.timers))?;

        let init = ProtocolInit {
            events: &self.events,
            config: &self.config,
        };
        let protocol = match (reg.create)(&init) {
            Ok(protocol) => protocol,
            Err(e) => {
                // Kinds registered before the failure go away with it
                self.events.unregister_source(reg.name);
                table.free();
                return Err(e);
            }
        };

        protocols.insert(RegisteredProtocol {
            name: reg.name,
            tcp_ports: reg.tcp_ports,
            protocol,
            table,
        });
        info!("Registered protocol {} (table size {})", reg.name, size);
        Ok(())
    }

    /// Tear a protocol down: all of its flows, then its events
    pub fn unregister_protocol(&self, name: &str) -> Result<()> {
        let proto = self
            .protocols
            .write()
            .remove(name)
            .ok_or_else(|| Error::UnknownProtocol(name.to_string()))?;

        proto.table.free();
        let result = proto.protocol.cleanup(&self.events);
        self.events.unregister_source(proto.name);
        info!("Unregistered protocol {}", proto.name);
        result
    }

    pub fn protocol_names(&self) -> Vec<&'static str> {
        self.protocols.read().names()
    }

    /// Protocol registered for a TCP port
    pub fn protocol_for_port(&self, port: u16) -> Option<&'static str> {
        self.protocols.read().for_tcp_port(port)
    }

    /// Conntrack table of a registered protocol
    pub fn table(&self, name: &str) -> Option<Arc<ConntrackTable>> {
        if name == TRANSPORT_PROTO {
            return Some(Arc::clone(&self.transport));
        }
        self.protocols.read().get_by_name(name).map(|p| Arc::clone(&p.table))
    }

    /// Resolve the transport flow for a port pair and push its expiry back
    pub fn track_transport(&self, fwd: u16, rev: u16) -> Result<Arc<ConntrackEntry>> {
        let entry = self
            .transport
            .get_or_create(&Value::U16(fwd), Some(&Value::U16(rev)), None)?;
        let timeout = Duration::from_secs(self.config.conntrack.transport_timeout_secs);
        if !timeout.is_zero() {
            entry.delayed_cleanup(timeout)?;
        }
        Ok(entry)
    }

    /// Hand a segment to a protocol
    pub fn process_stream(&self, name: &str, segment: &StreamSegment<'_>) -> Result<ProcessStatus> {
        let (protocol, table) = {
            let protocols = self.protocols.read();
            let proto = protocols
                .get_by_name(name)
                .ok_or_else(|| Error::UnknownProtocol(name.to_string()))?;
            (Arc::clone(&proto.protocol), Arc::clone(&proto.table))
        };

        let ctx = ProcessContext {
            table: &table,
            events: &self.events,
            timers: &self.timers,
            config: &self.config,
        };
        protocol.process(&ctx, segment)
    }

    /// Fire expired timers
    pub fn run_timers(&self, now: Instant) -> usize {
        self.timers.process(now)
    }

    /// Drive the timer queue from the current tokio runtime
    pub fn spawn_timer_driver(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        debug!("Starting timer driver every {:?}", interval);
        self.timers.spawn_driver(interval)
    }

    pub fn stats(&self) -> EngineStats {
        let protocols = self.protocols.read();
        EngineStats {
            transport: self.transport.stats(),
            protocols: protocols
                .names()
                .into_iter()
                .filter_map(|name| {
                    let proto = protocols.get_by_name(name)?;
                    Some((name.to_string(), proto.table.stats()))
                })
                .collect(),
            timers_pending: self.timers.pending(),
            timers_fired: self.timers.fired(),
            event_kinds: self.events.kinds().len(),
        }
    }

    /// Unregister every protocol, newest first, then drop the transport flows
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut result = Ok(());
        for name in self.protocol_names().into_iter().rev() {
            if let Err(e) = self.unregister_protocol(name) {
                warn!("Failed to unregister protocol {}: {}", name, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.transport.free();
        info!("Engine shut down");
        result
    }
}
