//! State shared between the controller façade and its worker threads.

use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::debug;

use crate::controller::Options;
use crate::event::Listeners;
use crate::frame::DataFrame;
use crate::handler::{HandlerContext, HandlerRegistry, Outcome};
use crate::message::{Priority, SerialMessage};
use crate::node::{NodeRegistry, NodeStage};
use crate::port::SerialLink;
use crate::queue::SendQueue;
use crate::signal::{Cause, CompletionSignal};
use crate::state::ControllerState;

/// A level-triggered stop flag the watchdog can sleep against.
#[derive(Debug, Default)]
pub(crate) struct Shutdown {
    stopped: Mutex<bool>,
    changed: Condvar,
}

impl Shutdown {
    /// Signals shutdown, waking all sleepers.
    pub fn trigger(&self) {
        *self.stopped.lock().expect("shutdown lock poisoned") = true;
        self.changed.notify_all();
    }

    /// Sleeps for `period` or until shutdown. Returns whether shutdown was
    /// signalled.
    pub fn wait_for(&self, period: Duration) -> bool {
        let stopped = self.stopped.lock().expect("shutdown lock poisoned");
        let (stopped, _) = self
            .changed
            .wait_timeout_while(stopped, period, |stopped| !*stopped)
            .expect("shutdown lock poisoned");
        *stopped
    }
}

/// Everything the engine worker, the receive loop, the watchdog and the
/// façade share.
#[derive(Debug)]
pub(crate) struct Shared<W> {
    pub link: SerialLink<W>,
    pub queue: SendQueue,
    pub signal: CompletionSignal,
    pub nodes: NodeRegistry,
    pub state: ControllerState,
    pub handlers: HandlerRegistry,
    pub listeners: Listeners,
    pub in_flight: Mutex<Option<SerialMessage>>,
    pub running: AtomicBool,
    pub shutdown: Shutdown,
    pub options: Options,
}

impl<W> Shared<W> {
    /// Creates the shared core around an unconnected link.
    pub fn new(options: Options) -> Self {
        Self {
            link: SerialLink::disconnected(),
            queue: SendQueue::new(options.queue_capacity),
            signal: CompletionSignal::new(),
            nodes: NodeRegistry::new(),
            state: ControllerState::new(),
            handlers: HandlerRegistry::with_defaults(),
            listeners: Listeners::new(),
            in_flight: Mutex::new(None),
            running: AtomicBool::new(true),
            shutdown: Shutdown::default(),
            options,
        }
    }

    /// Returns whether the workers should keep running.
    pub fn is_running(&self) -> bool {
        self.running.load(Relaxed)
    }

    /// Stops all workers: closes the queue and the latch and triggers the
    /// watchdog's shutdown flag.
    pub fn stop(&self) {
        self.running.store(false, Relaxed);
        self.queue.close();
        self.signal.close();
        self.shutdown.trigger();
    }

    /// Builds a handler context borrowing from this core.
    pub fn handler_ctx(&self) -> HandlerContext<'_> {
        HandlerContext::new(&self.queue, &self.nodes, &self.state, &self.listeners)
    }

    /// Returns a copy of the message currently in flight.
    pub fn in_flight(&self) -> Option<SerialMessage> {
        self.in_flight
            .lock()
            .expect("in-flight slot lock poisoned")
            .clone()
    }

    /// Dispatches a validated frame to its message processor and raises the
    /// completion latch if the processor declared the in-flight transaction
    /// complete.
    pub fn handle_frame(&self, frame: &DataFrame) {
        let in_flight = self.in_flight();
        let ctx = self.handler_ctx();

        match self.handlers.dispatch(&ctx, in_flight.as_ref(), frame) {
            Some(Outcome::Complete) => {
                if in_flight.is_some() {
                    self.signal.raise(Cause::Completed);
                }
            }
            Some(Outcome::Pending) => {}
            None => debug!("No processor for {frame}. Ignoring."),
        }
    }

    /// Declares nodes dead whose interview stalled for longer than the
    /// configured threshold, and finishes initialization if that was the
    /// last thing missing.
    ///
    /// Skipped entirely while a `Low`-priority message is pending: a
    /// sleeping-node ping is still queued, so nothing can be concluded.
    pub fn check_for_dead_nodes(&self) {
        if self.queue.contains_priority(Priority::Low) {
            debug!("Skipping dead-node check: low-priority traffic is pending.");
            return;
        }

        if self.nodes.is_empty() {
            return;
        }

        let threshold = self.options.stage_stall_timeout;
        let mut newly_dead = Vec::new();

        self.nodes.each_node(|node| {
            if !node.is_complete() && node.stage_age() >= threshold {
                log::warn!(
                    "Node {} stalled in stage {:?}. Declaring it dead.",
                    node.id,
                    node.stage()
                );
                node.set_stage(NodeStage::Dead);
                newly_dead.push(node.id);
            }
        });

        let ctx = self.handler_ctx();
        ctx.finish_initialization_if_complete();

        for node_id in newly_dead {
            ctx.emit(&crate::event::Event::NodeStatus {
                node_id,
                state: crate::event::NodeState::Dead,
            });
        }
    }
}
