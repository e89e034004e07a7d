//! Protocol registry
//!
//! Keeps the registered protocols together with their conntrack tables and
//! provides lookup by name and TCP port.

use std::collections::HashMap;
use std::sync::Arc;

use crate::conntrack::{ConntrackInfo, ConntrackTable};
use crate::Result;
use super::traits::{Protocol, ProtocolInit};

/// Protocol registration entry
pub struct ProtocolRegistration {
    /// Protocol identifier (e.g., "imap")
    pub name: &'static str,

    /// Default TCP ports
    pub tcp_ports: &'static [u16],

    /// Conntrack table requirements
    pub ct_info: ConntrackInfo,

    /// Factory creating the protocol instance
    pub create: fn(&ProtocolInit<'_>) -> Result<Arc<dyn Protocol>>,
}

/// A protocol that made it through registration
#[derive(Clone)]
pub struct RegisteredProtocol {
    pub name: &'static str,
    pub tcp_ports: &'static [u16],
    pub protocol: Arc<dyn Protocol>,
    pub table: Arc<ConntrackTable>,
}

#[derive(Default)]
pub struct ProtocolRegistry {
    /// Registered protocols, in registration order
    protocols: Vec<RegisteredProtocol>,

    /// TCP port → protocol name
    tcp_ports: HashMap<u16, &'static str>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, proto: RegisteredProtocol) {
        for &port in proto.tcp_ports {
            self.tcp_ports.entry(port).or_insert(proto.name);
        }
        self.protocols.push(proto);
    }

    pub fn remove(&mut self, name: &str) -> Option<RegisteredProtocol> {
        let pos = self.protocols.iter().position(|p| p.name == name)?;
        let proto = self.protocols.remove(pos);
        self.tcp_ports.retain(|_, n| *n != name);
        Some(proto)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&RegisteredProtocol> {
        self.protocols.iter().find(|p| p.name == name)
    }

    /// Name of the protocol registered for a TCP port
    pub fn for_tcp_port(&self, port: u16) -> Option<&'static str> {
        self.tcp_ports.get(&port).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get_by_name(name).is_some()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.protocols.iter().map(|p| p.name).collect()
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }
}
