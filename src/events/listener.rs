//! Listener capability implemented by event consumers.

use super::event::{Event, EventType};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Shared reference to a registered listener.
///
/// Registration identity is the allocation behind the `Arc`, not the
/// listener's name: two listeners may share a name.
pub type ListenerRef = Arc<dyn Listener>;

/// Something that consumes events of one or more types.
///
/// `handle` runs on the engine's dispatch thread, one event at a time. A
/// handler that blocks stalls delivery for every other listener, so long
/// work should be handed off elsewhere.
pub trait Listener: Send + Sync {
    /// Name used in logs and failure reports
    fn name(&self) -> &str;

    /// Event types this listener wants. The engine files the listener
    /// under these at registration; later changes do not move it.
    fn event_types(&self) -> &HashSet<EventType>;

    /// Checked before every delivery
    fn can_handle(&self, event_type: EventType) -> bool {
        self.event_types().contains(&event_type)
    }

    /// Handle an event. Errors and panics are caught and reported by the engine.
    fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Whether two references point at the same listener object
pub fn same_listener(a: &ListenerRef, b: &ListenerRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Listener backed by a closure
pub struct FnListener<F> {
    name: String,
    event_types: HashSet<EventType>,
    handler: F,
}

impl<F> FnListener<F>
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(
        name: impl Into<String>,
        event_types: impl IntoIterator<Item = EventType>,
        handler: F,
    ) -> Self {
        Self {
            name: name.into(),
            event_types: event_types.into_iter().collect(),
            handler,
        }
    }

    /// Wrap into a shareable reference ready for registration
    pub fn shared(
        name: impl Into<String>,
        event_types: impl IntoIterator<Item = EventType>,
        handler: F,
    ) -> Arc<Self> {
        Arc::new(Self::new(name, event_types, handler))
    }
}

impl<F> Listener for FnListener<F>
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn event_types(&self) -> &HashSet<EventType> {
        &self.event_types
    }

    fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.handler)(event)
    }
}

impl<F> fmt::Debug for FnListener<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnListener")
            .field("name", &self.name)
            .field("event_types", &self.event_types)
            .finish()
    }
}
