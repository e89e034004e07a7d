//! Reassembled stream segments

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conntrack::ConntrackEntry;

/// Direction of a segment relative to its flow's forward key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Same orientation as the entry's forward value
    Forward,
    /// Opposite orientation
    Reverse,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }

    /// Index into per-direction arrays
    pub fn index(self) -> usize {
        match self {
            Direction::Forward => 0,
            Direction::Reverse => 1,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Forward => write!(f, "fwd"),
            Direction::Reverse => write!(f, "rev"),
        }
    }
}

/// Bytes of one direction of a stream, as delivered by reassembly
#[derive(Debug, Clone)]
pub struct StreamSegment<'a> {
    /// Entry of the transport layer carrying this stream
    pub parent: Option<Arc<ConntrackEntry>>,
    pub direction: Direction,
    pub payload: &'a [u8],
    pub ts: DateTime<Utc>,
}

impl<'a> StreamSegment<'a> {
    pub fn new(parent: Option<Arc<ConntrackEntry>>, direction: Direction, payload: &'a [u8]) -> Self {
        Self {
            parent,
            direction,
            payload,
            ts: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = ts;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
