//! Core protocol analyzer traits and types
//!
//! Defines the interface every stream protocol implements to plug into the
//! engine.

use std::sync::Arc;

use crate::config::Config;
use crate::conntrack::ConntrackTable;
use crate::core::StreamSegment;
use crate::event::EventRegistry;
use crate::timer::TimerQueue;
use crate::Result;

/// Outcome of processing one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Segment consumed
    Ok,
    /// Segment consumed, a unit is still incomplete
    WantMore,
    /// The protocol stopped inspecting this flow
    Stop,
}

/// Everything a protocol may touch while processing a segment
pub struct ProcessContext<'a> {
    /// This protocol's conntrack table
    pub table: &'a Arc<ConntrackTable>,
    pub events: &'a EventRegistry,
    pub timers: &'a Arc<TimerQueue>,
    pub config: &'a Config,
}

/// Passed to a protocol's constructor at registration
pub struct ProtocolInit<'a> {
    pub events: &'a EventRegistry,
    pub config: &'a Config,
}

/// Stream protocol analyzer
///
/// One instance per registered protocol, shared by every flow. Per-flow
/// state lives in the private state of the flow's conntrack entry.
pub trait Protocol: Send + Sync {
    /// Protocol identifier (e.g., "imap")
    fn name(&self) -> &'static str;

    /// Consume one reassembled segment of a flow
    fn process(&self, ctx: &ProcessContext<'_>, segment: &StreamSegment<'_>) -> Result<ProcessStatus>;

    /// Release protocol-wide resources at unregistration
    fn cleanup(&self, _events: &EventRegistry) -> Result<()> {
        Ok(())
    }
}
