//! Event kind registry
//!
//! Kinds are registered by protocols at init and unregistered at protocol
//! teardown. Listener lists live on the kinds themselves; the registry
//! drives the first/last listener notifications.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::{EventError, EventKind, EventKindInfo, EventListener, EVENT_API_VERSION};

pub struct EventRegistry {
    kinds: RwLock<Vec<Arc<EventKind>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self {
            kinds: RwLock::new(Vec::new()),
        }
    }

    /// Register a new event kind
    pub fn register(&self, info: EventKindInfo) -> Result<Arc<EventKind>, EventError> {
        if info.api_ver != EVENT_API_VERSION {
            return Err(EventError::ApiVersion {
                name: info.name.to_string(),
                expected: EVENT_API_VERSION,
                got: info.api_ver,
            });
        }

        let mut kinds = self.kinds.write();
        if kinds.iter().any(|k| k.name() == info.name) {
            return Err(EventError::Duplicate(info.name.to_string()));
        }

        let kind = Arc::new(EventKind::new(info));
        debug!("Registered event {} from {}", kind.name(), kind.source());
        kinds.push(Arc::clone(&kind));
        Ok(kind)
    }

    pub fn unregister(&self, name: &str) -> Result<(), EventError> {
        let mut kinds = self.kinds.write();
        let pos = kinds
            .iter()
            .position(|k| k.name() == name)
            .ok_or_else(|| EventError::NotFound(name.to_string()))?;
        let kind = kinds.remove(pos);
        if kind.has_listeners() {
            debug!(
                "Unregistering event {} with {} listeners attached",
                kind.name(),
                kind.listener_count()
            );
        }
        Ok(())
    }

    /// Unregister every kind owned by `source`, returning how many went away
    pub fn unregister_source(&self, source: &str) -> usize {
        let mut kinds = self.kinds.write();
        let before = kinds.len();
        kinds.retain(|k| k.source() != source);
        let removed = before - kinds.len();
        if removed > 0 {
            info!("Unregistered {} events of {}", removed, source);
        }
        removed
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<EventKind>> {
        self.kinds.read().iter().find(|k| k.name() == name).cloned()
    }

    pub fn kinds(&self) -> Vec<Arc<EventKind>> {
        self.kinds.read().clone()
    }

    pub fn kinds_of(&self, source: &str) -> Vec<Arc<EventKind>> {
        self.kinds
            .read()
            .iter()
            .filter(|k| k.source() == source)
            .cloned()
            .collect()
    }

    /// Attach a listener. The first listener triggers the kind's notifier;
    /// if it fails the listener is not added.
    pub fn add_listener(
        &self,
        kind: &Arc<EventKind>,
        listener: Arc<dyn EventListener>,
    ) -> Result<(), EventError> {
        let mut listeners = kind.listeners.write();
        if listeners.is_empty() {
            kind.notify(true)?;
        }
        debug!("Listener {} added to event {}", listener.name(), kind.name());
        listeners.push(listener);
        kind.set_listener_count(listeners.len());
        Ok(())
    }

    /// Attach a listener to the kind called `name`
    pub fn listen(&self, name: &str, listener: Arc<dyn EventListener>) -> Result<(), EventError> {
        let kind = self
            .get_by_name(name)
            .ok_or_else(|| EventError::NotFound(name.to_string()))?;
        self.add_listener(&kind, listener)
    }

    /// Detach the listener called `listener_name`. Removing the last one
    /// triggers the kind's notifier; if it fails the listener stays.
    pub fn remove_listener(
        &self,
        kind: &Arc<EventKind>,
        listener_name: &str,
    ) -> Result<Arc<dyn EventListener>, EventError> {
        let mut listeners = kind.listeners.write();
        let pos = listeners
            .iter()
            .position(|l| l.name() == listener_name)
            .ok_or_else(|| EventError::ListenerNotFound {
                kind: kind.name().to_string(),
                listener: listener_name.to_string(),
            })?;

        if listeners.len() == 1 {
            kind.notify(false)?;
        }
        let listener = listeners.remove(pos);
        kind.set_listener_count(listeners.len());
        debug!("Listener {} removed from event {}", listener_name, kind.name());
        Ok(listener)
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::event::{CollectListener, DataItemReg, Event};
    use crate::types::{Value, ValueType};

    fn info(name: &'static str) -> EventKindInfo {
        EventKindInfo::new(name, "test", "Test event")
            .with_data(&[DataItemReg::new("n", ValueType::U32)])
    }

    struct FailingListener;

    impl EventListener for FailingListener {
        fn name(&self) -> &str {
            "failing"
        }

        fn process_end(&self, _evt: &Event) -> crate::Result<()> {
            Err(crate::Error::Config("nope".into()))
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let reg = EventRegistry::new();
        let kind = reg.register(info("a")).unwrap();
        let found = reg.get_by_name("a").unwrap();
        assert!(Arc::ptr_eq(&kind, &found));
        assert!(reg.get_by_name("b").is_none());
    }

    #[test]
    fn test_duplicate_rejected() {
        let reg = EventRegistry::new();
        reg.register(info("a")).unwrap();
        assert!(matches!(reg.register(info("a")), Err(EventError::Duplicate(_))));
    }

    #[test]
    fn test_api_version_rejected() {
        let reg = EventRegistry::new();
        let mut bad = info("a");
        bad.api_ver = EVENT_API_VERSION + 1;
        let err = reg.register(bad).unwrap_err();
        assert!(matches!(err, EventError::ApiVersion { got, .. } if got == EVENT_API_VERSION + 1));
        assert!(reg.get_by_name("a").is_none());
    }

    #[test]
    fn test_unregister_source() {
        let reg = EventRegistry::new();
        reg.register(info("a")).unwrap();
        reg.register(info("b")).unwrap();
        reg.register(EventKindInfo::new("c", "other", "")).unwrap();
        assert_eq!(reg.unregister_source("test"), 2);
        assert_eq!(reg.kinds().len(), 1);
        assert!(matches!(reg.unregister("a"), Err(EventError::NotFound(_))));
        reg.unregister("c").unwrap();
    }

    #[test]
    fn test_first_last_notification() {
        let reg = EventRegistry::new();
        let present = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));
        let (p, c) = (present.clone(), calls.clone());
        let kind = reg
            .register(info("a").with_notify(Arc::new(move |has: bool| -> crate::Result<()> {
                p.store(has, Ordering::SeqCst);
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })))
            .unwrap();

        reg.add_listener(&kind, Arc::new(CollectListener::new("one"))).unwrap();
        assert!(present.load(Ordering::SeqCst));
        reg.add_listener(&kind, Arc::new(CollectListener::new("two"))).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(kind.listener_count(), 2);

        reg.remove_listener(&kind, "one").unwrap();
        assert!(present.load(Ordering::SeqCst));
        reg.remove_listener(&kind, "two").unwrap();
        assert!(!present.load(Ordering::SeqCst));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!kind.has_listeners());
    }

    #[test]
    fn test_notify_failure_aborts_add() {
        let reg = EventRegistry::new();
        let kind = reg
            .register(info("a").with_notify(Arc::new(|_: bool| -> crate::Result<()> {
                Err(crate::Error::Config("refused".into()))
            })))
            .unwrap();
        let err = reg.add_listener(&kind, Arc::new(CollectListener::new("one"))).unwrap_err();
        assert!(matches!(err, EventError::Notify { .. }));
        assert!(!kind.has_listeners());
    }

    #[test]
    fn test_remove_unknown_listener() {
        let reg = EventRegistry::new();
        let kind = reg.register(info("a")).unwrap();
        let err = reg.remove_listener(&kind, "ghost").err();
        assert!(matches!(err, Some(EventError::ListenerNotFound { .. })));
    }

    #[test]
    fn test_dispatch_order_and_failure() {
        let reg = EventRegistry::new();
        let kind = reg.register(info("a")).unwrap();
        let first = Arc::new(CollectListener::new("first"));
        let last = Arc::new(CollectListener::new("last"));
        reg.add_listener(&kind, first.clone()).unwrap();
        reg.add_listener(&kind, Arc::new(FailingListener)).unwrap();
        reg.add_listener(&kind, last.clone()).unwrap();

        let mut evt = Event::alloc(&kind);
        evt.set(0, Value::U32(7)).unwrap();
        let err = evt.process().unwrap_err();
        assert!(matches!(err, EventError::Listener { ref listener, .. } if listener == "failing"));

        // Listeners after the failing one never see the event
        assert_eq!(first.len(), 1);
        assert_eq!(last.len(), 0);
    }
}
