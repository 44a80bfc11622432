//! The transaction engine worker.

use std::io::Write;
use std::sync::Arc;
use std::thread::{sleep, spawn, JoinHandle};
use std::time::Duration;

use log::{debug, error, trace, warn};

use crate::event::Event;
use crate::frame::DataFrame;
use crate::message::{MessageClass, MessageType, Priority, SerialMessage};
use crate::node::NodeStage;
use crate::shared::Shared;
use crate::signal::{Cause, Wait};

/// How long the engine waits after a CAN before its next take, giving the
/// stick time to settle.
const CAN_BACKOFF: Duration = Duration::from_millis(100);

/// The send worker.
///
/// Takes messages off the queue one at a time and keeps exactly one
/// transaction in flight: from the moment a frame is written until the
/// completion latch is raised or the response timeout fires, no further
/// message is sent.
pub(crate) struct Engine<W> {
    shared: Arc<Shared<W>>,
}

impl<W> Engine<W>
where
    W: Write + Send + 'static,
{
    /// Spawns the engine worker thread.
    pub fn spawn(shared: Arc<Shared<W>>) -> JoinHandle<()> {
        spawn(move || Self { shared }.run())
    }

    fn run(self) {
        debug!("Transaction engine started.");

        while self.shared.is_running() {
            if !self.cycle() {
                break;
            }
        }

        debug!("Transaction engine terminating.");
    }

    /// Runs one queue-take-to-completion cycle.
    ///
    /// Returns `false` when the engine should exit (queue closed, latch
    /// closed or the port went away).
    fn cycle(&self) -> bool {
        let Some(message) = self.shared.queue.take() else {
            return false;
        };

        let Some(message) = self.defer_for_sleeping_target(message) else {
            return true;
        };

        // Reset the latch before the frame hits the wire, so a completion
        // that races the wait below is never lost and a stale signal from a
        // previous transaction never leaks in.
        self.shared.signal.drain();

        let frame = DataFrame::new(message.message_type, message.class, &message.payload);
        let bytes = match frame.to_bytes() {
            Ok(bytes) => bytes,
            Err(error) => {
                error!("Cannot encode {frame}: {error}. Discarding.");
                return true;
            }
        };

        // Mark the message in flight before it hits the wire, so a response
        // arriving faster than this thread resumes still finds it.
        *self
            .shared
            .in_flight
            .lock()
            .expect("in-flight slot lock poisoned") = Some(message.clone());

        if let Err(error) = self.shared.link.write_all(&bytes) {
            error!("Failed to write {frame}: {error}");
            *self
                .shared
                .in_flight
                .lock()
                .expect("in-flight slot lock poisoned") = None;
            self.shared.queue.push(message);
            return false;
        }

        trace!("Sent {frame}, awaiting completion.");

        let outcome = self.shared.signal.wait(self.shared.options.response_timeout);

        *self
            .shared
            .in_flight
            .lock()
            .expect("in-flight slot lock poisoned") = None;

        match outcome {
            Wait::Signalled(Cause::Completed) => {
                trace!("Transaction for {frame} completed.");
                self.shared
                    .listeners
                    .emit(&Event::TransactionCompleted(message));
            }
            Wait::Signalled(Cause::Nak) => {
                warn!("Controller NAKed {frame}.");
                self.retry_or_discard(message);
            }
            Wait::Signalled(Cause::Can) => {
                debug!("Controller cancelled {frame}. Requeueing after backoff.");
                self.shared.queue.push(message);
                sleep(CAN_BACKOFF);
            }
            Wait::TimedOut => self.handle_timeout(message),
            Wait::Closed => return false,
        }

        true
    }

    /// Moves a SendData message for a sleeping target onto that node's
    /// wake-up queue.
    ///
    /// Returns the message back if it should be sent now.
    fn defer_for_sleeping_target(&self, message: SerialMessage) -> Option<SerialMessage> {
        if message.class != MessageClass::SendData || message.priority == Priority::Low {
            return Some(message);
        }

        let Some(node_id) = message.target_node else {
            return Some(message);
        };

        if !self.shared.nodes.is_asleep(node_id) {
            return Some(message);
        }

        self.shared
            .nodes
            .with_node(node_id, |node| node.defer_until_wake_up(message));
        None
    }

    fn handle_timeout(&self, message: SerialMessage) {
        self.shared.state.counters.count_timeout();
        warn!(
            "Transaction for {:?} timed out after {:?}.",
            message.class, self.shared.options.response_timeout
        );

        if message.class == MessageClass::SendData {
            // Tell the stick to stop trying before we reattempt.
            self.send_abort();
        }

        self.retry_or_discard(message);
    }

    /// Sends a SendDataAbort frame outside of the queue, with the same
    /// atomic write discipline as any other frame.
    fn send_abort(&self) {
        let frame = DataFrame::new(MessageType::Request, MessageClass::SendDataAbort, &[]);

        match frame.to_bytes() {
            Ok(bytes) => {
                if let Err(error) = self.shared.link.write_all(&bytes) {
                    error!("Failed to send SendDataAbort: {error}");
                }
            }
            Err(error) => error!("Cannot encode SendDataAbort: {error}"),
        }
    }

    fn retry_or_discard(&self, mut message: SerialMessage) {
        if message.attempts_remaining == 0 {
            warn!(
                "Discarding {:?} to node {:?}: no attempts remaining.",
                message.class, message.target_node
            );
            return;
        }

        message.attempts_remaining -= 1;

        if message.class == MessageClass::SendData {
            self.handle_failed_send_data(message);
        } else {
            self.shared.queue.push(message);
        }
    }

    /// Decides what to do with a SendData message that failed to complete:
    /// drop it if the target is dead, park it on the wake-up queue if the
    /// target is asleep, retry it otherwise.
    fn handle_failed_send_data(&self, message: SerialMessage) {
        let Some(node_id) = message.target_node else {
            self.shared.queue.push(message);
            return;
        };

        let target_dead = self
            .shared
            .nodes
            .with_node(node_id, |node| node.stage() == NodeStage::Dead)
            .unwrap_or(false);

        if target_dead {
            warn!("Dropping SendData to dead node {node_id}.");
            return;
        }

        if self.shared.nodes.is_asleep(node_id) {
            self.shared
                .nodes
                .with_node(node_id, |node| node.defer_until_wake_up(message));
            return;
        }

        self.shared.queue.push(message);
    }
}
