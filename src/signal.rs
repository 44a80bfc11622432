//! The transaction completion latch.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Why the completion latch was raised.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Cause {
    /// A message processor declared the transaction complete.
    Completed,
    /// The controller sent a NAK; the transaction is invalid.
    Nak,
    /// The controller sent a CAN; the frame was discarded mid-transfer.
    Can,
}

/// Outcome of waiting on the latch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Wait {
    /// The latch was raised within the timeout.
    Signalled(Cause),
    /// The timeout elapsed without a signal.
    TimedOut,
    /// The latch was closed; the driver is shutting down.
    Closed,
}

#[derive(Debug, Default)]
struct State {
    cause: Option<Cause>,
    closed: bool,
}

/// A binary, non-counting "one is enough" latch.
///
/// The transaction engine is the sole waiter; the receive loop (and the
/// processors it calls into) are the raisers. Raising an already-raised
/// latch keeps the first cause. A signal raised before the waiter arrives
/// persists until [`drain`](Self::drain)ed, so a fast responder cannot be
/// missed.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    state: Mutex<State>,
    raised: Condvar,
}

impl CompletionSignal {
    /// Creates a new, unsignalled latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the latch. The first cause wins; later raises are no-ops.
    pub fn raise(&self, cause: Cause) {
        let mut state = self.state.lock().expect("completion signal lock poisoned");

        if state.cause.is_none() {
            state.cause = Some(cause);
        }

        drop(state);
        self.raised.notify_all();
    }

    /// Resets the latch to "not signalled".
    pub fn drain(&self) {
        self.state
            .lock()
            .expect("completion signal lock poisoned")
            .cause = None;
    }

    /// Waits up to `timeout` for the latch to be raised.
    pub fn wait(&self, timeout: Duration) -> Wait {
        let mut state = self.state.lock().expect("completion signal lock poisoned");
        let mut remaining = timeout;

        loop {
            if state.closed {
                return Wait::Closed;
            }

            if let Some(cause) = state.cause.take() {
                return Wait::Signalled(cause);
            }

            let start = std::time::Instant::now();
            let (guard, result) = self
                .raised
                .wait_timeout(state, remaining)
                .expect("completion signal lock poisoned");
            state = guard;

            if result.timed_out() {
                return Wait::TimedOut;
            }

            remaining = remaining.saturating_sub(start.elapsed());
        }
    }

    /// Closes the latch, waking the waiter permanently.
    pub fn close(&self) {
        self.state
            .lock()
            .expect("completion signal lock poisoned")
            .closed = true;
        self.raised.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::{Cause, CompletionSignal, Wait};

    #[test]
    fn test_raise_before_wait_is_not_lost() {
        let signal = CompletionSignal::new();
        signal.raise(Cause::Completed);
        assert_eq!(
            signal.wait(Duration::from_millis(1)),
            Wait::Signalled(Cause::Completed)
        );
    }

    #[test]
    fn test_first_cause_wins() {
        let signal = CompletionSignal::new();
        signal.raise(Cause::Can);
        signal.raise(Cause::Completed);
        assert_eq!(
            signal.wait(Duration::from_millis(1)),
            Wait::Signalled(Cause::Can)
        );
    }

    #[test]
    fn test_drain_resets() {
        let signal = CompletionSignal::new();
        signal.raise(Cause::Nak);
        signal.drain();
        assert_eq!(signal.wait(Duration::from_millis(1)), Wait::TimedOut);
    }

    #[test]
    fn test_wait_consumes_the_signal() {
        let signal = CompletionSignal::new();
        signal.raise(Cause::Completed);
        assert_eq!(
            signal.wait(Duration::from_millis(1)),
            Wait::Signalled(Cause::Completed)
        );
        assert_eq!(signal.wait(Duration::from_millis(1)), Wait::TimedOut);
    }

    #[test]
    fn test_cross_thread_raise() {
        let signal = Arc::new(CompletionSignal::new());
        let raiser = {
            let signal = signal.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                signal.raise(Cause::Completed);
            })
        };

        assert_eq!(
            signal.wait(Duration::from_secs(5)),
            Wait::Signalled(Cause::Completed)
        );
        raiser.join().unwrap();
    }

    #[test]
    fn test_close_wakes_waiter() {
        let signal = Arc::new(CompletionSignal::new());
        let closer = {
            let signal = signal.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                signal.close();
            })
        };

        assert_eq!(signal.wait(Duration::from_secs(5)), Wait::Closed);
        closer.join().unwrap();
    }
}
