//! Change-notification stream consumed by UIs and the addon bus.
//!
//! Producers (the store) push events into a per-client ring; clients drain
//! their ring by uuid. Unknown uuids are registered on first drain.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::package::Destination;

/// Cap per client ring; older events are dropped once a slow client lags this far.
const RING_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Update,
    Remove,
    Insert,
    Order,
    Reload,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Update => "update",
            EventKind::Remove => "remove",
            EventKind::Insert => "insert",
            EventKind::Order => "order",
            EventKind::Reload => "reload",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    Package,
    File,
}

impl ElementType {
    pub fn value(self) -> u8 {
        match self {
            ElementType::Package => 0,
            ElementType::File => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ElementType::Package => "PACKAGE",
            ElementType::File => "FILE",
        }
    }
}

/// One change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreEvent {
    pub kind: EventKind,
    pub destination: Destination,
    /// Absent for `reload` events.
    pub element: Option<ElementType>,
    /// Absent for `reload` events.
    pub id: Option<u64>,
}

impl CoreEvent {
    pub fn changed(kind: EventKind, destination: Destination, element: ElementType, id: u64) -> Self {
        CoreEvent {
            kind,
            destination,
            element: Some(element),
            id: Some(id),
        }
    }

    pub fn reload(destination: Destination) -> Self {
        CoreEvent {
            kind: EventKind::Reload,
            destination,
            element: None,
            id: None,
        }
    }
}

/// Fan-out buffer: every known client sees every event once.
#[derive(Default)]
pub struct EventBus {
    clients: Mutex<HashMap<String, VecDeque<CoreEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: CoreEvent) {
        let mut clients = self.clients.lock().unwrap();
        for ring in clients.values_mut() {
            if ring.len() >= RING_CAP {
                ring.pop_front();
            }
            ring.push_back(event);
        }
    }

    /// Drain pending events for `uuid`, registering the client if new.
    /// A new client receives a reload event for both destinations first.
    pub fn drain(&self, uuid: &str) -> Vec<CoreEvent> {
        let mut clients = self.clients.lock().unwrap();
        match clients.get_mut(uuid) {
            Some(ring) => ring.drain(..).collect(),
            None => {
                clients.insert(uuid.to_string(), VecDeque::new());
                vec![
                    CoreEvent::reload(Destination::Queue),
                    CoreEvent::reload(Destination::Collector),
                ]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_client_gets_reload_pair() {
        let bus = EventBus::new();
        let first = bus.drain("c1");
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|e| e.kind == EventKind::Reload));
    }

    #[test]
    fn events_fan_out_to_registered_clients_only() {
        let bus = EventBus::new();
        let _ = bus.drain("a");
        let _ = bus.drain("b");
        bus.push(CoreEvent::changed(
            EventKind::Insert,
            Destination::Queue,
            ElementType::Package,
            5,
        ));
        let a = bus.drain("a");
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].id, Some(5));
        let b = bus.drain("b");
        assert_eq!(b.len(), 1);
        // second drain is empty
        assert!(bus.drain("a").is_empty());
    }

    #[test]
    fn ring_drops_oldest_when_full() {
        let bus = EventBus::new();
        let _ = bus.drain("slow");
        for i in 0..(RING_CAP as u64 + 10) {
            bus.push(CoreEvent::changed(
                EventKind::Update,
                Destination::Queue,
                ElementType::File,
                i,
            ));
        }
        let events = bus.drain("slow");
        assert_eq!(events.len(), RING_CAP);
        assert_eq!(events[0].id, Some(10));
    }
}
