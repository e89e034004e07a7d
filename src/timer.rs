//! Delayed expiry scheduler
//!
//! One-shot timers that are allocated once with a callback, then queued,
//! re-queued or dequeued any number of times. Expired timers are collected by
//! `process(now)` and their callbacks run outside of the queue lock, so a
//! callback may itself queue or release timers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

/// Timer callback
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle of an allocated timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TimerId(u64);

struct TimerSlot {
    deadline: Option<(Instant, u64)>,
    callback: TimerCallback,
}

#[derive(Default)]
struct TimerInner {
    /// (deadline, sequence) -> timer
    pending: BTreeMap<(Instant, u64), TimerId>,
    timers: HashMap<TimerId, TimerSlot>,
    seq: u64,
}

/// Queue of one-shot timers
pub struct TimerQueue {
    inner: Mutex<TimerInner>,
    next_id: AtomicU64,
    fired: AtomicU64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TimerInner::default()),
            next_id: AtomicU64::new(1),
            fired: AtomicU64::new(0),
        }
    }

    /// Allocate a timer; it is not queued yet
    pub fn alloc<F>(&self, callback: F) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.lock().timers.insert(
            id,
            TimerSlot {
                deadline: None,
                callback: Arc::new(callback),
            },
        );
        id
    }

    /// Queue a timer to fire after `delay`, replacing any pending deadline.
    /// Returns false if the timer was released.
    pub fn queue(&self, id: TimerId, delay: Duration) -> bool {
        self.queue_at(id, Instant::now() + delay)
    }

    /// Queue a timer at an absolute deadline
    pub fn queue_at(&self, id: TimerId, deadline: Instant) -> bool {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let key = (deadline, inner.seq);

        let Some(slot) = inner.timers.get_mut(&id) else {
            return false;
        };
        let old = slot.deadline.replace(key);
        if let Some(old) = old {
            inner.pending.remove(&old);
        }
        inner.pending.insert(key, id);
        trace!("Timer {:?} queued", id);
        true
    }

    /// Remove a timer from the queue without releasing it
    pub fn dequeue(&self, id: TimerId) -> bool {
        let mut inner = self.inner.lock();
        let old = inner.timers.get_mut(&id).and_then(|slot| slot.deadline.take());
        match old {
            Some(key) => {
                inner.pending.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Dequeue and release a timer
    pub fn release(&self, id: TimerId) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.timers.remove(&id) {
            if let Some(key) = slot.deadline {
                inner.pending.remove(&key);
            }
        }
    }

    /// Is the timer currently queued
    pub fn is_queued(&self, id: TimerId) -> bool {
        self.inner
            .lock()
            .timers
            .get(&id)
            .map(|slot| slot.deadline.is_some())
            .unwrap_or(false)
    }

    /// Number of queued timers
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Earliest queued deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.lock().pending.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Total callbacks fired since creation
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    /// Fire every timer whose deadline is at or before `now`.
    /// Returns the number of callbacks invoked.
    pub fn process(&self, now: Instant) -> usize {
        let due: Vec<TimerCallback> = {
            let mut inner = self.inner.lock();
            let later = inner.pending.split_off(&(now, u64::MAX));
            let expired = std::mem::replace(&mut inner.pending, later);

            expired
                .into_values()
                .filter_map(|id| {
                    let slot = inner.timers.get_mut(&id)?;
                    slot.deadline = None;
                    Some(slot.callback.clone())
                })
                .collect()
        };

        for callback in &due {
            callback();
        }

        if !due.is_empty() {
            self.fired.fetch_add(due.len() as u64, Ordering::Relaxed);
            debug!("Fired {} timers", due.len());
        }
        due.len()
    }

    /// Run `process` periodically on the current tokio runtime
    pub fn spawn_driver(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                queue.process(Instant::now());
            }
        })
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_fires_after_deadline() {
        let queue = TimerQueue::new();
        let (count, cb) = counter();
        let id = queue.alloc(cb);
        assert!(queue.queue(id, Duration::from_secs(10)));

        assert_eq!(queue.process(Instant::now()), 0);
        assert_eq!(queue.process(Instant::now() + Duration::from_secs(11)), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // One-shot: not fired again
        assert_eq!(queue.process(Instant::now() + Duration::from_secs(60)), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dequeue_prevents_firing() {
        let queue = TimerQueue::new();
        let (count, cb) = counter();
        let id = queue.alloc(cb);
        queue.queue(id, Duration::from_secs(1));
        assert!(queue.dequeue(id));

        queue.process(Instant::now() + Duration::from_secs(5));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_requeue_replaces_deadline() {
        let queue = TimerQueue::new();
        let (count, cb) = counter();
        let id = queue.alloc(cb);
        queue.queue(id, Duration::from_secs(1));
        queue.queue(id, Duration::from_secs(100));
        assert_eq!(queue.pending(), 1);

        queue.process(Instant::now() + Duration::from_secs(5));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        queue.process(Instant::now() + Duration::from_secs(101));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_forgets_timer() {
        let queue = TimerQueue::new();
        let (_count, cb) = counter();
        let id = queue.alloc(cb);
        queue.queue(id, Duration::from_secs(1));
        queue.release(id);
        assert_eq!(queue.pending(), 0);
        assert!(!queue.queue(id, Duration::from_secs(1)));
    }

    #[test]
    fn test_callback_may_touch_queue() {
        let queue = Arc::new(TimerQueue::new());
        let q = Arc::downgrade(&queue);
        let slot = Arc::new(Mutex::new(None::<TimerId>));
        let s = slot.clone();
        let id = queue.alloc(move || {
            if let (Some(q), Some(id)) = (q.upgrade(), *s.lock()) {
                q.release(id);
            }
        });
        *slot.lock() = Some(id);
        queue.queue(id, Duration::ZERO);
        assert_eq!(queue.process(Instant::now() + Duration::from_millis(1)), 1);
        assert!(!queue.is_queued(id));
    }

    #[tokio::test]
    async fn test_driver_fires_timers() {
        let queue = Arc::new(TimerQueue::new());
        let (count, cb) = counter();
        let id = queue.alloc(cb);
        queue.queue(id, Duration::from_millis(5));

        let handle = queue.spawn_driver(Duration::from_millis(2));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
