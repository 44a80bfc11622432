//! The watchdog worker.

use std::io::{Read, Write};
use std::mem::replace;
use std::sync::Arc;
use std::thread::{spawn, JoinHandle};

use log::{debug, error, warn};

use crate::engine::Engine;
use crate::port::PortFactory;
use crate::receive::ReceiveLoop;
use crate::shared::Shared;

/// Periodic liveness supervisor.
///
/// Every period it respawns worker threads that died from I/O errors
/// (reopening the port through the factory) and runs the dead-node check.
/// On shutdown it joins both workers.
pub(crate) struct Watchdog<R, W> {
    shared: Arc<Shared<W>>,
    engine: JoinHandle<()>,
    receive: JoinHandle<()>,
    factory: Option<PortFactory<R, W>>,
}

impl<R, W> Watchdog<R, W>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    /// Spawns the watchdog thread supervising the given workers.
    pub fn spawn(
        shared: Arc<Shared<W>>,
        engine: JoinHandle<()>,
        receive: JoinHandle<()>,
        factory: Option<PortFactory<R, W>>,
    ) -> JoinHandle<()> {
        spawn(move || {
            Self {
                shared,
                engine,
                receive,
                factory,
            }
            .run();
        })
    }

    fn run(mut self) {
        debug!("Watchdog started.");

        loop {
            if self.shared.shutdown.wait_for(self.shared.options.watchdog_period) {
                break;
            }

            if !self.shared.is_running() {
                break;
            }

            self.check_workers();
            self.shared.check_for_dead_nodes();
        }

        // Shutting down: the queue and latch are closed, the port reads
        // time out; both workers wind down on their own.
        let _ = self.engine.join();
        let _ = self.receive.join();
        debug!("Watchdog terminating.");
    }

    fn check_workers(&mut self) {
        let engine_dead = self.engine.is_finished();
        let receive_dead = self.receive.is_finished();

        if !engine_dead && !receive_dead {
            return;
        }

        let Some(factory) = self.factory.as_ref() else {
            error!("A worker thread exited and no reconnect path is configured.");
            return;
        };

        warn!("A worker thread exited. Reopening the port.");

        match factory() {
            Ok((reader, writer)) => {
                self.shared.link.replace(writer);
                self.shared.signal.drain();

                if engine_dead {
                    let old = replace(&mut self.engine, Engine::spawn(self.shared.clone()));
                    let _ = old.join();
                }

                if receive_dead {
                    let old = replace(
                        &mut self.receive,
                        ReceiveLoop::spawn(reader, self.shared.clone()),
                    );
                    let _ = old.join();
                }
            }
            Err(error) => {
                warn!("Reconnect failed: {error}. Retrying next period.");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::Watchdog;
    use crate::controller::Options;
    use crate::engine::Engine;
    use crate::event::recording::Recorder;
    use crate::event::{Event, NodeState};
    use crate::message::{MessageClass, Priority, SerialMessage};
    use crate::node::{Node, NodeStage};
    use crate::port::mock::{self, MockReader, MockWriter, Stick};
    use crate::port::PortFactory;
    use crate::receive::ReceiveLoop;
    use crate::shared::Shared;

    fn stalled_node(id: u8) -> Node {
        let mut node = Node::new(id);
        node.listening = true;
        node.set_stage(NodeStage::NodeInfo);
        node
    }

    fn shared_with_zero_stall() -> Arc<Shared<MockWriter>> {
        let mut options = Options::default();
        options.stage_stall_timeout = Duration::ZERO;
        Arc::new(Shared::new(options))
    }

    #[test]
    fn test_stalled_node_is_declared_dead() {
        let shared = shared_with_zero_stall();
        let recorder = Recorder::new();
        shared.listeners.add(recorder.clone());
        shared.nodes.add(stalled_node(9));

        shared.check_for_dead_nodes();

        assert_eq!(
            shared.nodes.with_node(9, |node| node.stage()),
            Some(NodeStage::Dead)
        );

        // With the stalled node dead, initialization is complete; that event
        // precedes the dead-node notification.
        let events = recorder.events();
        assert!(matches!(events[0], Event::InitializationCompleted(_)));
        assert!(matches!(
            events[1],
            Event::NodeStatus {
                node_id: 9,
                state: NodeState::Dead
            }
        ));
    }

    #[test]
    fn test_check_is_skipped_while_low_priority_traffic_pends() {
        let shared = shared_with_zero_stall();
        shared.nodes.add(stalled_node(9));
        shared.queue.push(
            SerialMessage::request(MessageClass::SendData, [7, 1, 0x20, 0x25, 1])
                .with_priority(Priority::Low),
        );

        shared.check_for_dead_nodes();

        assert_eq!(
            shared.nodes.with_node(9, |node| node.stage()),
            Some(NodeStage::NodeInfo)
        );
    }

    #[test]
    fn test_initialization_completed_is_emitted_once() {
        let shared = shared_with_zero_stall();
        let recorder = Recorder::new();
        shared.listeners.add(recorder.clone());
        shared.nodes.add(stalled_node(9));

        shared.check_for_dead_nodes();
        shared.check_for_dead_nodes();
        shared.check_for_dead_nodes();

        assert_eq!(
            recorder.count(|e| matches!(e, Event::InitializationCompleted(_))),
            1
        );
    }

    #[test]
    fn test_dead_receive_loop_is_respawned() {
        let mut options = Options::default();
        options.watchdog_period = Duration::from_millis(30);
        let shared = Arc::new(Shared::<MockWriter>::new(options));

        let (first_stick, reader, writer) = mock::pair(Duration::from_millis(10));
        shared.link.replace(writer);

        let sticks: Arc<Mutex<Vec<Stick>>> = Arc::new(Mutex::new(Vec::new()));
        let factory: PortFactory<MockReader, MockWriter> = {
            let sticks = sticks.clone();
            Box::new(move || {
                let (stick, reader, writer) = mock::pair(Duration::from_millis(10));
                sticks.lock().unwrap().push(stick);
                Ok((reader, writer))
            })
        };

        let engine = Engine::spawn(shared.clone());
        let receive = ReceiveLoop::spawn(reader, shared.clone());
        let watchdog =
            Watchdog::<MockReader, MockWriter>::spawn(shared.clone(), engine, receive, Some(factory));

        // Dropping the stick ends the reader's byte stream; the receive
        // loop exits with an I/O error and must come back on a fresh port.
        drop(first_stick);

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        loop {
            let resynced = sticks
                .lock()
                .unwrap()
                .last()
                .is_some_and(|stick| stick.written() == [0x15]);

            if resynced {
                break;
            }

            assert!(
                std::time::Instant::now() < deadline,
                "receive loop was not respawned"
            );
            std::thread::sleep(Duration::from_millis(10));
        }

        shared.stop();
        let _ = watchdog.join();
    }
}
