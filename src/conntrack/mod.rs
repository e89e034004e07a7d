//! Connection tracking
//!
//! Tracks flows at every protocol layer that needs per-connection state.
//! Each layer owns one [`ConntrackTable`]; entries of an inner layer (IMAP)
//! are children of the outer layer's entry (TCP) and never outlive it.
//!
//! # Example
//!
//! ```ignore
//! use flowscope::conntrack::{ConntrackTable, ConntrackInfo};
//!
//! let table = ConntrackTable::new("tcp", 1024, true, timers.clone());
//! let entry = table.get_or_create(&Value::U16(143), Some(&Value::U16(50000)), None)?;
//!
//! // Expire the flow after a grace period
//! entry.delayed_cleanup(Duration::from_secs(300))?;
//! ```

pub mod entry;
pub mod hash;
pub mod table;

pub use entry::{ConntrackEntry, ConntrackPriv, EntryId, EntryState};
pub use hash::conntrack_hash;
pub use table::{ConntrackTable, TableStats};

use thiserror::Error;

/// Conntrack requirements declared by a protocol at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConntrackInfo {
    /// Number of hash buckets (1 when the protocol has no key of its own)
    pub default_table_size: usize,
    /// Keys have a reverse value (dual-direction hashing)
    pub has_reverse: bool,
}

impl ConntrackInfo {
    pub const fn new(default_table_size: usize, has_reverse: bool) -> Self {
        Self {
            default_table_size,
            has_reverse,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConntrackError {
    #[error("cannot hash an empty key")]
    EmptyKey,

    #[error("table {0} has no reverse direction")]
    NoReverseTable(&'static str),

    #[error("table {0} has been freed")]
    TableFreed(&'static str),

    #[error("table size must be greater than zero")]
    ZeroSize,

    #[error("conntrack entry {0} is being destroyed")]
    Destroyed(EntryId),

    #[error("conntrack entry {id} missing from the {index} index of table {proto}")]
    IndexCorrupted {
        proto: &'static str,
        id: EntryId,
        index: &'static str,
    },
}
