//! Events delivered to driver subscribers.

use std::sync::{Arc, Mutex};

use crate::message::SerialMessage;

/// Reported liveness of a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeState {
    /// The node answers on the mesh.
    Alive,
    /// The node stopped answering and was declared dead.
    Dead,
    /// A battery node announced it is awake.
    Awake,
    /// A battery node went back to sleep.
    Asleep,
}

/// An asynchronous notification from the driver.
#[derive(Clone, Debug)]
pub enum Event {
    /// A transaction finished; carries the message that was sent.
    TransactionCompleted(SerialMessage),
    /// Every node reached a final interview state; carries our node ID.
    InitializationCompleted(u8),
    /// A node's liveness changed.
    NodeStatus {
        /// The node in question.
        node_id: u8,
        /// Its new state.
        state: NodeState,
    },
    /// A node joined the network through inclusion.
    NodeAdded(u8),
    /// A node left the network through exclusion or failed-node removal.
    NodeRemoved(u8),
}

/// A subscriber to driver [`Event`]s.
///
/// Listeners are called from driver worker threads and must not block for
/// long.
pub trait EventListener: Send + Sync {
    /// Handles a single event.
    fn on_event(&self, event: &Event);
}

/// The subscriber list.
///
/// Dispatch iterates over a snapshot, so listeners may subscribe or
/// unsubscribe (even themselves) while an event is being delivered.
#[derive(Default)]
pub struct Listeners {
    inner: Mutex<Vec<Arc<dyn EventListener>>>,
}

impl Listeners {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a listener.
    pub fn add(&self, listener: Arc<dyn EventListener>) {
        self.inner
            .lock()
            .expect("listener list lock poisoned")
            .push(listener);
    }

    /// Unsubscribes a listener. Listeners are compared by identity.
    pub fn remove(&self, listener: &Arc<dyn EventListener>) {
        self.inner
            .lock()
            .expect("listener list lock poisoned")
            .retain(|candidate| !Arc::ptr_eq(candidate, listener));
    }

    /// Unsubscribes everything.
    pub fn clear(&self) {
        self.inner
            .lock()
            .expect("listener list lock poisoned")
            .clear();
    }

    /// Delivers an event to all current subscribers.
    pub fn emit(&self, event: &Event) {
        let snapshot = self
            .inner
            .lock()
            .expect("listener list lock poisoned")
            .clone();

        log::trace!("Emitting {event:?} to {} listener(s).", snapshot.len());

        for listener in snapshot {
            listener.on_event(event);
        }
    }
}

impl core::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Listeners")
            .field(
                "count",
                &self.inner.lock().expect("listener list lock poisoned").len(),
            )
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
    use std::sync::Arc;

    use super::{Event, EventListener, Listeners, NodeState};

    struct Counting(AtomicUsize);

    impl EventListener for Counting {
        fn on_event(&self, _event: &Event) {
            self.0.fetch_add(1, Relaxed);
        }
    }

    #[test]
    fn test_emit_reaches_all_listeners() {
        let listeners = Listeners::new();
        let first = Arc::new(Counting(AtomicUsize::new(0)));
        let second = Arc::new(Counting(AtomicUsize::new(0)));

        listeners.add(first.clone());
        listeners.add(second.clone());
        listeners.emit(&Event::NodeStatus {
            node_id: 9,
            state: NodeState::Dead,
        });

        assert_eq!(first.0.load(Relaxed), 1);
        assert_eq!(second.0.load(Relaxed), 1);
    }

    #[test]
    fn test_remove_by_identity() {
        let listeners = Listeners::new();
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        listeners.add(counting.clone());

        let erased: Arc<dyn EventListener> = counting.clone();
        listeners.remove(&erased);
        listeners.emit(&Event::InitializationCompleted(1));

        assert_eq!(counting.0.load(Relaxed), 0);
    }

    struct SelfRemoving {
        listeners: Arc<Listeners>,
        myself: std::sync::Mutex<Option<Arc<dyn EventListener>>>,
    }

    impl EventListener for SelfRemoving {
        fn on_event(&self, _event: &Event) {
            if let Some(myself) = self.myself.lock().unwrap().take() {
                self.listeners.remove(&myself);
            }
        }
    }

    #[test]
    fn test_listener_may_unsubscribe_during_dispatch() {
        let listeners = Arc::new(Listeners::new());
        let listener = Arc::new(SelfRemoving {
            listeners: listeners.clone(),
            myself: std::sync::Mutex::new(None),
        });
        *listener.myself.lock().unwrap() = Some(listener.clone());
        listeners.add(listener);

        // Must not deadlock and must not panic.
        listeners.emit(&Event::InitializationCompleted(1));
        listeners.emit(&Event::InitializationCompleted(1));
    }
}
