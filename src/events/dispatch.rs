//! Index from event type to the listeners interested in it.

use super::event::EventType;
use super::listener::{same_listener, ListenerRef};
use std::collections::HashMap;

/// Dispatch table.
///
/// `listeners` is the authoritative registration set; `buckets` hold the
/// same references grouped by declared type, in registration order. A
/// listener sits in the bucket for `T` iff it is registered and declared
/// `T` when it was registered.
#[derive(Default)]
pub struct DispatchTable {
    listeners: Vec<ListenerRef>,
    buckets: HashMap<EventType, Vec<ListenerRef>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, listener: &ListenerRef) -> bool {
        self.listeners.iter().any(|l| same_listener(l, listener))
    }

    /// Add a listener to every bucket it declares.
    ///
    /// Returns `false` without touching the table if the same listener
    /// object is already registered.
    pub fn register(&mut self, listener: ListenerRef) -> bool {
        if self.contains(&listener) {
            return false;
        }

        let mut types: Vec<EventType> = listener.event_types().iter().copied().collect();
        types.sort();
        for event_type in types {
            self.buckets
                .entry(event_type)
                .or_default()
                .push(listener.clone());
        }
        self.listeners.push(listener);
        true
    }

    /// Remove a listener from every bucket and from the set.
    ///
    /// Returns `false` if it was not registered.
    pub fn unregister(&mut self, listener: &ListenerRef) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| !same_listener(l, listener));
        if self.listeners.len() == before {
            return false;
        }

        // Scan every bucket rather than trusting event_types(), which may
        // have changed since registration.
        self.buckets.retain(|_, bucket| {
            bucket.retain(|l| !same_listener(l, listener));
            !bucket.is_empty()
        });
        true
    }

    /// Registered listeners in registration order
    pub fn listeners(&self) -> Vec<ListenerRef> {
        self.listeners.clone()
    }

    /// Copy of the bucket for `event_type`, empty if nobody is interested
    pub fn snapshot(&self, event_type: EventType) -> Vec<ListenerRef> {
        self.buckets.get(&event_type).cloned().unwrap_or_default()
    }

    pub fn bucket_len(&self, event_type: EventType) -> usize {
        self.buckets.get(&event_type).map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::listener::FnListener;
    use std::sync::Arc;

    fn listener(name: &str, types: &[EventType]) -> ListenerRef {
        FnListener::shared(name, types.iter().copied(), |_| Ok(()))
    }

    fn names(listeners: &[ListenerRef]) -> Vec<String> {
        listeners.iter().map(|l| l.name().to_string()).collect()
    }

    #[test]
    fn test_register_fills_declared_buckets() {
        let mut table = DispatchTable::new();
        let a = listener("a", &[EventType::MarketData, EventType::Error]);

        assert!(table.register(a.clone()));

        assert_eq!(table.len(), 1);
        assert_eq!(table.bucket_len(EventType::MarketData), 1);
        assert_eq!(table.bucket_len(EventType::Error), 1);
        assert_eq!(table.bucket_len(EventType::OrderUpdate), 0);
    }

    #[test]
    fn test_register_twice_is_noop() {
        let mut table = DispatchTable::new();
        let a = listener("a", &[EventType::MarketData]);

        assert!(table.register(a.clone()));
        assert!(!table.register(a.clone()));

        assert_eq!(table.len(), 1);
        assert_eq!(table.bucket_len(EventType::MarketData), 1);
    }

    #[test]
    fn test_identity_not_name() {
        let mut table = DispatchTable::new();
        let first = listener("same", &[EventType::Info]);
        let second = listener("same", &[EventType::Info]);

        assert!(table.register(first.clone()));
        assert!(table.register(second.clone()));
        assert_eq!(table.bucket_len(EventType::Info), 2);

        assert!(table.unregister(&first));
        let remaining = table.snapshot(EventType::Info);
        assert_eq!(remaining.len(), 1);
        assert!(same_listener(&remaining[0], &second));
    }

    #[test]
    fn test_unregister_removes_from_every_bucket() {
        let mut table = DispatchTable::new();
        let a = listener("a", &[EventType::MarketData, EventType::TradeUpdate]);
        table.register(a.clone());

        assert!(table.unregister(&a));

        assert!(table.is_empty());
        assert!(table.snapshot(EventType::MarketData).is_empty());
        assert!(table.snapshot(EventType::TradeUpdate).is_empty());
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let mut table = DispatchTable::new();
        let a = listener("a", &[EventType::MarketData]);
        let b = listener("b", &[EventType::MarketData]);
        table.register(a);

        assert!(!table.unregister(&b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_order_stable_when_others_churn() {
        let mut table = DispatchTable::new();
        let a = listener("a", &[EventType::MarketData]);
        let b = listener("b", &[EventType::MarketData]);
        let c = listener("c", &[EventType::MarketData]);
        table.register(a.clone());
        table.register(b.clone());
        table.register(c.clone());

        table.unregister(&b);
        assert_eq!(names(&table.snapshot(EventType::MarketData)), ["a", "c"]);

        table.register(b.clone());
        assert_eq!(names(&table.snapshot(EventType::MarketData)), ["a", "c", "b"]);
        assert_eq!(names(&table.listeners()), ["a", "c", "b"]);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut table = DispatchTable::new();
        let a = listener("a", &[EventType::System]);
        table.register(a.clone());

        let snapshot = table.snapshot(EventType::System);
        table.unregister(&a);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(table.bucket_len(EventType::System), 0);
    }

    #[test]
    fn test_listener_without_types() {
        let mut table = DispatchTable::new();
        let idle: ListenerRef = Arc::new(FnListener::new("idle", [], |_| Ok(())));

        assert!(table.register(idle.clone()));
        assert_eq!(table.len(), 1);
        for t in EventType::ALL {
            assert_eq!(table.bucket_len(t), 0);
        }
        assert!(table.unregister(&idle));
    }

    #[test]
    fn test_clear() {
        let mut table = DispatchTable::new();
        table.register(listener("a", &[EventType::Info]));
        table.register(listener("b", &[EventType::Error]));

        table.clear();

        assert!(table.is_empty());
        assert_eq!(table.bucket_len(EventType::Info), 0);
    }
}
