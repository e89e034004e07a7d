//! Conntrack entries
//!
//! An entry is shared as `Arc<ConntrackEntry>`. Its identity (keys, hashes,
//! parent) is immutable; everything that changes over its lifetime lives in
//! [`EntryState`] behind the entry lock.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::core::Direction;
use crate::timer::TimerId;
use crate::types::Value;
use super::table::ConntrackTable;
use super::ConntrackError;

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique identifier of a conntrack entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntryId(u64);

impl EntryId {
    pub(crate) fn next() -> Self {
        EntryId(NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Protocol-owned private state attached to an entry
///
/// `cleanup` is invoked exactly once, when the entry is destroyed by expiry,
/// explicit cleanup or table teardown.
pub trait ConntrackPriv: Send + 'static {
    /// Release the state
    fn cleanup(self: Box<Self>) -> crate::Result<()>;

    /// Get as Any for downcasting
    fn as_any(&self) -> &dyn Any;

    /// Get as Any mut for downcasting
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Mutable part of an entry, guarded by the entry lock
#[derive(Default)]
pub struct EntryState {
    pub(crate) children: Vec<Arc<ConntrackEntry>>,
    private: Option<Box<dyn ConntrackPriv>>,
    pub(crate) timer: Option<TimerId>,
    pub(crate) destroyed: bool,
}

impl EntryState {
    pub fn has_private(&self) -> bool {
        self.private.is_some()
    }

    /// Attach private state, returning the previous one
    pub fn set_private(&mut self, private: Box<dyn ConntrackPriv>) -> Option<Box<dyn ConntrackPriv>> {
        self.private.replace(private)
    }

    /// Get typed private state
    pub fn private<T: ConntrackPriv>(&self) -> Option<&T> {
        self.private.as_ref()?.as_any().downcast_ref::<T>()
    }

    /// Get typed private state mutably
    pub fn private_mut<T: ConntrackPriv>(&mut self) -> Option<&mut T> {
        self.private.as_mut()?.as_any_mut().downcast_mut::<T>()
    }

    pub(crate) fn take_private(&mut self) -> Option<Box<dyn ConntrackPriv>> {
        self.private.take()
    }

    pub fn children(&self) -> &[Arc<ConntrackEntry>] {
        &self.children
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn timer(&self) -> Option<TimerId> {
        self.timer
    }
}

/// A tracked flow at one protocol layer
pub struct ConntrackEntry {
    id: EntryId,
    proto: &'static str,
    fwd_value: Value,
    rev_value: Option<Value>,
    fwd_hash: u32,
    rev_hash: Option<u32>,
    parent: Option<Weak<ConntrackEntry>>,
    parent_id: Option<EntryId>,
    table: Weak<ConntrackTable>,
    state: Mutex<EntryState>,
}

impl ConntrackEntry {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        proto: &'static str,
        fwd_value: Value,
        rev_value: Option<Value>,
        fwd_hash: u32,
        rev_hash: Option<u32>,
        parent: Option<&Arc<ConntrackEntry>>,
        table: Weak<ConntrackTable>,
    ) -> Self {
        Self {
            id: EntryId::next(),
            proto,
            fwd_value,
            rev_value,
            fwd_hash,
            rev_hash,
            parent: parent.map(Arc::downgrade),
            parent_id: parent.map(|p| p.id),
            table,
            state: Mutex::new(EntryState::default()),
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Name of the protocol owning this entry
    pub fn proto(&self) -> &'static str {
        self.proto
    }

    pub fn forward_value(&self) -> &Value {
        &self.fwd_value
    }

    pub fn reverse_value(&self) -> Option<&Value> {
        self.rev_value.as_ref()
    }

    pub fn forward_hash(&self) -> u32 {
        self.fwd_hash
    }

    pub fn reverse_hash(&self) -> Option<u32> {
        self.rev_hash
    }

    pub fn parent(&self) -> Option<Arc<ConntrackEntry>> {
        self.parent.as_ref()?.upgrade()
    }

    pub fn parent_id(&self) -> Option<EntryId> {
        self.parent_id
    }

    pub fn table(&self) -> Option<Arc<ConntrackTable>> {
        self.table.upgrade()
    }

    /// Direction of a packet whose forward key is `fwd`
    pub fn direction_of(&self, fwd: &Value) -> Direction {
        if *fwd == self.fwd_value {
            Direction::Forward
        } else {
            Direction::Reverse
        }
    }

    /// Lock the entry state
    pub fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    pub fn child_count(&self) -> usize {
        self.state.lock().children.len()
    }

    /// Schedule destruction of this entry after `delay`.
    ///
    /// A zero delay cancels a pending schedule. Re-arming replaces the
    /// previous deadline.
    pub fn delayed_cleanup(self: &Arc<Self>, delay: Duration) -> Result<(), ConntrackError> {
        let table = self.table.upgrade().ok_or(ConntrackError::TableFreed(self.proto))?;
        let timers = table.timers();

        let mut state = self.state.lock();
        if state.destroyed {
            return Err(ConntrackError::Destroyed(self.id));
        }

        if delay.is_zero() {
            if let Some(timer) = state.timer.take() {
                timers.release(timer);
                trace!("Cancelled cleanup of conntrack {} ({})", self.id, self.proto);
            }
            return Ok(());
        }

        let timer = match state.timer {
            Some(timer) => timer,
            None => {
                let weak = Arc::downgrade(self);
                let timer = timers.alloc(move || {
                    if let Some(entry) = weak.upgrade() {
                        if let Err(e) = entry.cleanup() {
                            warn!("Delayed cleanup of conntrack {} failed: {}", entry.id, e);
                        }
                    }
                });
                state.timer = Some(timer);
                timer
            }
        };

        timers.queue(timer, delay);
        trace!("Conntrack {} ({}) expires in {:?}", self.id, self.proto, delay);
        Ok(())
    }

    /// Destroy this entry and, first, all of its children.
    ///
    /// Runs at most once; later calls are no-ops.
    pub fn cleanup(self: &Arc<Self>) -> Result<(), ConntrackError> {
        self.cleanup_inner(true)
    }

    /// `detach` is false when the parent already took this entry out of its
    /// children list.
    fn cleanup_inner(self: &Arc<Self>, detach: bool) -> Result<(), ConntrackError> {
        let (children, private, timer) = {
            let mut state = self.state.lock();
            if state.destroyed {
                debug!("Conntrack {} ({}) already cleaned up", self.id, self.proto);
                return Ok(());
            }
            state.destroyed = true;
            (
                std::mem::take(&mut state.children),
                state.take_private(),
                state.timer.take(),
            )
        };

        let mut result = Ok(());

        // Children never outlive their parent
        for child in &children {
            if let Err(e) = child.cleanup_inner(false) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        drop(children);

        if detach {
            if let Some(parent) = self.parent() {
                let mut parent_state = parent.state.lock();
                match parent_state.children.iter().position(|c| Arc::ptr_eq(c, self)) {
                    Some(pos) => {
                        parent_state.children.swap_remove(pos);
                    }
                    None => warn!("Conntrack {} not found in parent's children list", self.id),
                }
            }
        }

        if let Some(private) = private {
            if let Err(e) = private.cleanup() {
                warn!("Unable to free the private state of conntrack {}: {}", self.id, e);
            }
        }

        if let Some(table) = self.table.upgrade() {
            let unlinked = table.unlink(self);
            if let Some(timer) = timer {
                table.timers().release(timer);
            }
            unlinked?;
        }

        trace!("Conntrack {} ({}) destroyed", self.id, self.proto);
        result
    }
}

impl fmt::Debug for ConntrackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConntrackEntry")
            .field("id", &self.id)
            .field("proto", &self.proto)
            .field("fwd_value", &self.fwd_value)
            .field("rev_value", &self.rev_value)
            .field("parent_id", &self.parent_id)
            .finish()
    }
}
