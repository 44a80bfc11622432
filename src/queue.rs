//! The priority-ordered send queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};

use crate::message::{Priority, SerialMessage};

/// A queued message together with its insertion order.
#[derive(Debug)]
struct Entry(SerialMessage);

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.sequence == other.0.sequence
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` pops the greatest entry first, so "greater" must mean
        // "more urgent": numerically lower priority, then lower sequence.
        other
            .0
            .priority
            .cmp(&self.0.priority)
            .then_with(|| other.0.sequence.cmp(&self.0.sequence))
    }
}

#[derive(Debug)]
struct Inner {
    heap: BinaryHeap<Entry>,
    next_sequence: u64,
    closed: bool,
}

/// An unbounded, concurrent send queue ordered by [`Priority`].
///
/// Messages of equal priority are delivered in submission order. A message
/// that re-enters the queue (after a CAN or a retry) keeps its original
/// position within its priority class.
#[derive(Debug)]
pub struct SendQueue {
    inner: Mutex<Inner>,
    available: Condvar,
}

impl SendQueue {
    /// Creates a new queue with the given initial capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::with_capacity(capacity),
                next_sequence: 1,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Appends a message to the queue.
    ///
    /// First-time submissions are stamped with the next sequence number;
    /// re-submitted messages keep theirs. Never blocks.
    pub fn push(&self, mut message: SerialMessage) {
        let mut inner = self.inner.lock().expect("send queue lock poisoned");

        if inner.closed {
            log::warn!("Discarding {:?}: the send queue is closed.", message.class);
            return;
        }

        if message.sequence == 0 {
            message.sequence = inner.next_sequence;
            inner.next_sequence += 1;
        }

        inner.heap.push(Entry(message));
        drop(inner);
        self.available.notify_one();
    }

    /// Takes the most urgent message, blocking until one is available.
    ///
    /// Returns `None` once the queue has been closed.
    pub fn take(&self) -> Option<SerialMessage> {
        let mut inner = self.inner.lock().expect("send queue lock poisoned");

        loop {
            if let Some(entry) = inner.heap.pop() {
                return Some(entry.0);
            }

            if inner.closed {
                return None;
            }

            inner = self
                .available
                .wait(inner)
                .expect("send queue lock poisoned");
        }
    }

    /// Returns the number of pending messages.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("send queue lock poisoned").heap.len()
    }

    /// Returns whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns whether any pending message has the given priority.
    pub fn contains_priority(&self, priority: Priority) -> bool {
        self.inner
            .lock()
            .expect("send queue lock poisoned")
            .heap
            .iter()
            .any(|entry| entry.0.priority == priority)
    }

    /// Removes all pending messages.
    pub fn clear(&self) {
        self.inner
            .lock()
            .expect("send queue lock poisoned")
            .heap
            .clear();
    }

    /// Closes the queue, waking all blocked takers.
    pub fn close(&self) {
        self.inner.lock().expect("send queue lock poisoned").closed = true;
        self.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::SendQueue;
    use crate::message::{MessageClass, Priority, SerialMessage};

    fn message(priority: Priority) -> SerialMessage {
        SerialMessage::request(MessageClass::GetVersion, []).with_priority(priority)
    }

    #[test]
    fn test_priority_order() {
        let queue = SendQueue::new(8);
        queue.push(message(Priority::Low));
        queue.push(message(Priority::Get));
        queue.push(message(Priority::High));
        queue.push(message(Priority::Set));

        assert_eq!(queue.take().unwrap().priority, Priority::High);
        assert_eq!(queue.take().unwrap().priority, Priority::Set);
        assert_eq!(queue.take().unwrap().priority, Priority::Get);
        assert_eq!(queue.take().unwrap().priority, Priority::Low);
    }

    #[test]
    fn test_fifo_within_priority() {
        let queue = SendQueue::new(8);

        for class in [
            MessageClass::GetVersion,
            MessageClass::MemoryGetId,
            MessageClass::SerialApiGetCapabilities,
        ] {
            queue.push(SerialMessage::request(class, []).with_priority(Priority::High));
        }

        assert_eq!(queue.take().unwrap().class, MessageClass::GetVersion);
        assert_eq!(queue.take().unwrap().class, MessageClass::MemoryGetId);
        assert_eq!(
            queue.take().unwrap().class,
            MessageClass::SerialApiGetCapabilities
        );
    }

    #[test]
    fn test_requeued_message_returns_to_the_front() {
        let queue = SendQueue::new(8);
        queue.push(message(Priority::Get));
        queue.push(message(Priority::Get));

        let first = queue.take().unwrap();
        queue.push(message(Priority::Get));
        // Re-submitting keeps the original sequence number, so the message
        // outranks everything enqueued after it.
        queue.push(first.clone());

        assert_eq!(queue.take().unwrap().sequence, first.sequence);
    }

    #[test]
    fn test_contains_priority() {
        let queue = SendQueue::new(8);
        assert!(!queue.contains_priority(Priority::Low));
        queue.push(message(Priority::Low));
        assert!(queue.contains_priority(Priority::Low));
        assert!(!queue.contains_priority(Priority::High));
    }

    #[test]
    fn test_take_blocks_until_push() {
        let queue = std::sync::Arc::new(SendQueue::new(8));
        let taker = {
            let queue = queue.clone();
            thread::spawn(move || queue.take())
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!taker.is_finished());

        queue.push(message(Priority::High));
        let taken = taker.join().unwrap();
        assert_eq!(taken.unwrap().priority, Priority::High);
    }

    #[test]
    fn test_close_unblocks_takers() {
        let queue = std::sync::Arc::new(SendQueue::new(8));
        let taker = {
            let queue = queue.clone();
            thread::spawn(move || queue.take())
        };

        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(taker.join().unwrap().is_none());
    }
}
