//! Conntrack hash tables
//!
//! Entries live in an arena keyed by [`EntryId`]; the forward and reverse
//! bucket arrays hold ids. One mutex guards the arena and both arrays.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::timer::TimerQueue;
use crate::types::Value;
use super::entry::{ConntrackEntry, EntryId};
use super::hash::conntrack_hash;
use super::ConntrackError;

/// Table statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableStats {
    pub lookups: u64,
    pub hits: u64,
    pub reverse_hits: u64,
    pub inserts: u64,
    pub removals: u64,
    pub entries: usize,
}

#[derive(Default)]
struct Counters {
    lookups: AtomicU64,
    hits: AtomicU64,
    reverse_hits: AtomicU64,
    inserts: AtomicU64,
    removals: AtomicU64,
}

struct TableInner {
    entries: HashMap<EntryId, Arc<ConntrackEntry>>,
    fwd: Vec<Vec<EntryId>>,
    rev: Option<Vec<Vec<EntryId>>>,
    freed: bool,
}

/// Scan a bucket for an exact (parent, forward, reverse) match
fn find(
    entries: &HashMap<EntryId, Arc<ConntrackEntry>>,
    bucket: &[EntryId],
    fwd: &Value,
    rev: Option<&Value>,
    parent: Option<EntryId>,
) -> Option<Arc<ConntrackEntry>> {
    bucket
        .iter()
        .filter_map(|id| entries.get(id))
        .find(|ce| {
            ce.parent_id() == parent
                && ce.forward_value() == fwd
                && match (ce.reverse_value(), rev) {
                    (Some(a), Some(b)) => a == b,
                    (None, None) => true,
                    _ => false,
                }
        })
        .cloned()
}

/// Connection tracking table of one protocol layer
pub struct ConntrackTable {
    proto: &'static str,
    tables_size: usize,
    has_reverse: bool,
    inner: Mutex<TableInner>,
    timers: Arc<TimerQueue>,
    self_ref: Weak<ConntrackTable>,
    counters: Counters,
}

impl ConntrackTable {
    /// Create a table with `tables_size` buckets per direction
    pub fn new(
        proto: &'static str,
        tables_size: usize,
        has_reverse: bool,
        timers: Arc<TimerQueue>,
    ) -> Result<Arc<Self>, ConntrackError> {
        if tables_size == 0 {
            return Err(ConntrackError::ZeroSize);
        }

        debug!(
            "Allocating conntrack table for {} (size={}, reverse={})",
            proto, tables_size, has_reverse
        );

        Ok(Arc::new_cyclic(|self_ref| Self {
            proto,
            tables_size,
            has_reverse,
            inner: Mutex::new(TableInner {
                entries: HashMap::new(),
                fwd: vec![Vec::new(); tables_size],
                rev: has_reverse.then(|| vec![Vec::new(); tables_size]),
                freed: false,
            }),
            timers,
            self_ref: self_ref.clone(),
            counters: Counters::default(),
        }))
    }

    pub fn proto(&self) -> &'static str {
        self.proto
    }

    pub fn tables_size(&self) -> usize {
        self.tables_size
    }

    pub fn has_reverse(&self) -> bool {
        self.has_reverse
    }

    pub fn timers(&self) -> &Arc<TimerQueue> {
        &self.timers
    }

    /// Find the entry for a key, creating it on a miss.
    ///
    /// A key with a reverse value also matches an entry created from the
    /// opposite direction, i.e. with forward and reverse swapped.
    pub fn get_or_create(
        &self,
        fwd: &Value,
        rev: Option<&Value>,
        parent: Option<&Arc<ConntrackEntry>>,
    ) -> Result<Arc<ConntrackEntry>, ConntrackError> {
        if rev.is_some() && !self.has_reverse {
            return Err(ConntrackError::NoReverseTable(self.proto));
        }

        let full_hash_fwd = conntrack_hash(fwd, rev)?;
        // Entries created from the other direction are indexed in the reverse
        // table under their own hash(rev, fwd), which is our hash(fwd, rev)
        let full_hash_rev = match rev {
            Some(rev) => Some(conntrack_hash(rev, Some(fwd))?),
            None => None,
        };
        let parent_id = parent.map(|p| p.id());
        let hash_fwd = full_hash_fwd as usize % self.tables_size;

        let mut inner = self.inner.lock();
        if inner.freed {
            return Err(ConntrackError::TableFreed(self.proto));
        }
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);

        if let Some(ce) = find(&inner.entries, &inner.fwd[hash_fwd], fwd, rev, parent_id) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(ce);
        }

        if let (Some(rev), Some(rev_table)) = (rev, inner.rev.as_ref()) {
            if let Some(ce) = find(&inner.entries, &rev_table[hash_fwd], rev, Some(fwd), parent_id) {
                self.counters.reverse_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(ce);
            }
        }

        let ce = Arc::new(ConntrackEntry::new(
            self.proto,
            fwd.clone(),
            rev.cloned(),
            full_hash_fwd,
            full_hash_rev,
            parent,
            self.self_ref.clone(),
        ));

        if let Some(parent) = parent {
            let mut parent_state = parent.lock();
            if parent_state.destroyed {
                return Err(ConntrackError::Destroyed(parent.id()));
            }
            parent_state.children.push(Arc::clone(&ce));
        }

        let id = ce.id();
        inner.fwd[hash_fwd].push(id);
        if let (Some(hash), Some(rev_table)) = (full_hash_rev, inner.rev.as_mut()) {
            rev_table[hash as usize % self.tables_size].push(id);
        }
        inner.entries.insert(id, Arc::clone(&ce));
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);

        Ok(ce)
    }

    /// The single entry of this table below `parent`, created on first use.
    ///
    /// For layers that have no key of their own and ride on the outer
    /// layer's flow.
    pub fn get_unique_from_parent(
        &self,
        parent: &Arc<ConntrackEntry>,
    ) -> Result<Arc<ConntrackEntry>, ConntrackError> {
        let key = Value::U64(parent.id().as_u64());
        self.get_or_create(&key, None, Some(parent))
    }

    /// Look up an entry by id
    pub fn get(&self, id: EntryId) -> Option<Arc<ConntrackEntry>> {
        self.inner.lock().entries.get(&id).cloned()
    }

    /// Remove an entry from both indexes
    pub(crate) fn unlink(&self, ce: &ConntrackEntry) -> Result<(), ConntrackError> {
        let mut inner = self.inner.lock();
        if inner.freed {
            return Ok(());
        }
        let id = ce.id();

        let bucket = ce.forward_hash() as usize % self.tables_size;
        let chain = &mut inner.fwd[bucket];
        match chain.iter().position(|e| *e == id) {
            Some(pos) => {
                chain.remove(pos);
            }
            None => {
                error!("Conntrack {} not found in the forward list for its hash", id);
                return Err(ConntrackError::IndexCorrupted {
                    proto: self.proto,
                    id,
                    index: "forward",
                });
            }
        }

        if let (Some(hash), Some(rev_table)) = (ce.reverse_hash(), inner.rev.as_mut()) {
            let chain = &mut rev_table[hash as usize % self.tables_size];
            match chain.iter().position(|e| *e == id) {
                Some(pos) => {
                    chain.remove(pos);
                }
                None => {
                    error!("Conntrack {} not found in the reverse list for its hash", id);
                    return Err(ConntrackError::IndexCorrupted {
                        proto: self.proto,
                        id,
                        index: "reverse",
                    });
                }
            }
        }

        inner.entries.remove(&id);
        self.counters.removals.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Tear down the whole table.
    ///
    /// Every remaining entry's private state is cleaned up; timers are
    /// released without firing.
    pub fn free(&self) {
        let entries = {
            let mut inner = self.inner.lock();
            if inner.freed {
                return;
            }
            inner.freed = true;
            inner.fwd.clear();
            inner.rev = None;
            std::mem::take(&mut inner.entries)
        };

        let count = entries.len();
        for ce in entries.into_values() {
            let (children, private, timer) = {
                let mut state = ce.lock();
                state.destroyed = true;
                (
                    std::mem::take(&mut state.children),
                    state.take_private(),
                    state.timer.take(),
                )
            };
            drop(children);

            if let Some(private) = private {
                if let Err(e) = private.cleanup() {
                    warn!("Unable to free the private state of conntrack {}: {}", ce.id(), e);
                }
            }
            if let Some(timer) = timer {
                self.timers.release(timer);
            }
        }

        info!("Freed conntrack table {} ({} entries)", self.proto, count);
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all live entries
    pub fn entries(&self) -> Vec<Arc<ConntrackEntry>> {
        self.inner.lock().entries.values().cloned().collect()
    }

    /// How many times `id` appears in the (forward, reverse) indexes
    pub fn index_count(&self, id: EntryId) -> (usize, usize) {
        let inner = self.inner.lock();
        let fwd = inner.fwd.iter().flatten().filter(|e| **e == id).count();
        let rev = inner
            .rev
            .as_ref()
            .map(|t| t.iter().flatten().filter(|e| **e == id).count())
            .unwrap_or(0);
        (fwd, rev)
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            lookups: self.counters.lookups.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            reverse_hits: self.counters.reverse_hits.load(Ordering::Relaxed),
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            removals: self.counters.removals.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
