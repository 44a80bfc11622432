//! The controller façade: public driver API.

use std::io::{Read, Write};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info};

use crate::engine::Engine;
use crate::error::Error;
use crate::event::{Event, EventListener, NodeState};
use crate::frame::MAX_PAYLOAD_SIZE;
use crate::handler::MessageHandler;
use crate::message::{MessageClass, MessageType, Priority, SerialMessage, TransmitOptions};
use crate::port::{self, PortFactory, TTYPort};
use crate::receive::ReceiveLoop;
use crate::shared::Shared;
use crate::state::{CounterSnapshot, LibraryType};
use crate::watchdog::Watchdog;

/// AddNode/RemoveNode mode: accept any node.
const NODE_ANY: u8 = 0x01;
/// AddNode/RemoveNode mode: stop the process.
const NODE_STOP: u8 = 0x05;
/// AddNode option: include at normal power.
const OPTION_HIGH_POWER: u8 = 0x80;
/// AddNode option: allow network-wide inclusion.
const OPTION_NETWORK_WIDE: u8 = 0x40;

/// Driver tunables.
#[derive(Clone, Debug)]
pub struct Options {
    /// How long a transaction may stay in flight before it times out.
    pub response_timeout: Duration,
    /// Inter-byte timeout of the serial port.
    pub receive_timeout: Duration,
    /// Period of the watchdog's liveness and dead-node checks.
    pub watchdog_period: Duration,
    /// How long a node may sit in one interview stage before it is
    /// declared dead.
    pub stage_stall_timeout: Duration,
    /// Initial capacity of the send queue.
    pub queue_capacity: usize,
    /// Delivery attempts per message.
    pub send_attempts: u8,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(5000),
            receive_timeout: Duration::from_millis(1000),
            watchdog_period: Duration::from_millis(10_000),
            stage_stall_timeout: Duration::from_millis(120_000),
            queue_capacity: 128,
            send_attempts: 3,
        }
    }
}

/// A Z-Wave serial controller.
///
/// Owns the three worker threads (transaction engine, receive loop and
/// watchdog) and exposes the command and query surface of the driver.
#[derive(Debug)]
pub struct Controller<W> {
    shared: Arc<Shared<W>>,
    watchdog: Option<JoinHandle<()>>,
}

impl Controller<TTYPort> {
    /// Opens the named serial port and starts the driver with default
    /// [`Options`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::PortUnavailable`] if the port cannot be opened.
    pub fn open(path: &str) -> Result<Self, Error> {
        Self::open_with(path, Options::default())
    }

    /// Opens the named serial port and starts the driver.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PortUnavailable`] if the port cannot be opened.
    pub fn open_with(path: &str, options: Options) -> Result<Self, Error> {
        let reader = port::open(path, options.receive_timeout)?;
        let writer = reader.try_clone_native()?;

        let receive_timeout = options.receive_timeout;
        let path = path.to_owned();
        let factory: PortFactory<TTYPort, TTYPort> = Box::new(move || {
            let reader = port::open(&path, receive_timeout).map_err(std::io::Error::from)?;
            let writer = reader.try_clone_native().map_err(std::io::Error::from)?;
            Ok((reader, writer))
        });

        Ok(Self::start(reader, writer, options, Some(factory)))
    }
}

impl<W> Controller<W>
where
    W: Write + Send + 'static,
{
    /// Starts the driver on an already-open transport.
    ///
    /// `factory` is used by the watchdog to reopen the transport after I/O
    /// failures; without one, dead workers are not respawned.
    pub fn start<R>(
        reader: R,
        writer: W,
        options: Options,
        factory: Option<PortFactory<R, W>>,
    ) -> Self
    where
        R: Read + Send + 'static,
    {
        let shared = Arc::new(Shared::new(options));
        shared.link.replace(writer);

        let engine = Engine::spawn(shared.clone());
        let receive = ReceiveLoop::spawn(reader, shared.clone());
        let watchdog = Watchdog::spawn(shared.clone(), engine, receive, factory);

        info!("Driver started.");

        Self {
            shared,
            watchdog: Some(watchdog),
        }
    }

    /// Shuts the driver down: stops and joins all workers, closes the
    /// port, clears the queue, the node table and the listener list.
    ///
    /// Idempotent; any in-flight transaction is abandoned without retry.
    pub fn close(&mut self) {
        let Some(watchdog) = self.watchdog.take() else {
            return;
        };

        info!("Closing driver.");
        self.shared.stop();
        self.shared.link.disconnect();
        let _ = watchdog.join();

        self.shared.queue.clear();
        self.shared.nodes.clear();
        self.shared.listeners.clear();
        self.shared.signal.drain();
        *self
            .shared
            .in_flight
            .lock()
            .expect("in-flight slot lock poisoned") = None;

        debug!("Driver closed.");
    }

    // --- queries ---------------------------------------------------------

    /// Returns whether the port is open and initialization has completed.
    pub fn is_connected(&self) -> bool {
        self.shared.link.is_connected() && self.shared.state.is_initialization_complete()
    }

    /// Returns the network's home ID.
    pub fn home_id(&self) -> u32 {
        self.shared.state.read_info(|info| info.home_id)
    }

    /// Returns the controller's own node ID.
    pub fn own_node_id(&self) -> u8 {
        self.shared.state.read_info(|info| info.own_node_id)
    }

    /// Returns the library version string reported by the stick.
    pub fn library_version(&self) -> String {
        self.shared
            .state
            .read_info(|info| info.library_version.clone())
    }

    /// Returns the library type reported by the stick.
    pub fn library_type(&self) -> LibraryType {
        self.shared.state.read_info(|info| info.library_type)
    }

    /// Returns the serial API application version.
    pub fn serial_api_version(&self) -> String {
        self.shared
            .state
            .read_info(|info| info.serial_api_version.clone())
    }

    /// Returns the manufacturer ID.
    pub fn manufacturer_id(&self) -> u16 {
        self.shared.state.read_info(|info| info.manufacturer_id)
    }

    /// Returns the device type.
    pub fn device_type(&self) -> u16 {
        self.shared.state.read_info(|info| info.device_type)
    }

    /// Returns the device ID.
    pub fn device_id(&self) -> u16 {
        self.shared.state.read_info(|info| info.device_id)
    }

    /// Returns the number of messages waiting in the send queue.
    pub fn send_queue_length(&self) -> usize {
        self.shared.queue.len()
    }

    /// Returns the receive and failure counters.
    pub fn counters(&self) -> CounterSnapshot {
        self.shared.state.counters.snapshot()
    }

    /// Returns the IDs of all known nodes.
    pub fn node_ids(&self) -> Vec<u8> {
        self.shared.nodes.node_ids()
    }

    // --- subscriptions ---------------------------------------------------

    /// Subscribes an event listener.
    pub fn add_event_listener(&self, listener: Arc<dyn EventListener>) {
        self.shared.listeners.add(listener);
    }

    /// Unsubscribes an event listener.
    pub fn remove_event_listener(&self, listener: &Arc<dyn EventListener>) {
        self.shared.listeners.remove(listener);
    }

    /// Installs (or replaces) the message processor for a class.
    pub fn register_handler(&self, class: MessageClass, handler: Arc<dyn MessageHandler>) {
        self.shared.handlers.register(class, handler);
    }

    // --- commands --------------------------------------------------------

    /// Starts the initialization handshake: version, IDs and capabilities.
    /// The node enumeration follows from the capabilities response.
    pub fn initialize(&self) {
        info!("Initializing controller.");
        self.command(MessageClass::GetVersion, Vec::new(), None);
        self.command(MessageClass::MemoryGetId, Vec::new(), None);
        self.command(MessageClass::SerialApiGetCapabilities, Vec::new(), None);
    }

    /// Queries protocol information for a node.
    pub fn identify_node(&self, node_id: u8) {
        self.command(MessageClass::IdentifyNode, vec![node_id], Some(node_id));
    }

    /// Asks a node for its node information frame.
    pub fn request_node_info(&self, node_id: u8) {
        self.command(MessageClass::RequestNodeInfo, vec![node_id], Some(node_id));
    }

    /// Reads a node's neighbor list from the controller.
    pub fn request_node_routing_info(&self, node_id: u8) {
        self.command(
            MessageClass::GetRoutingInfo,
            vec![node_id, 0x00, 0x00, 0x03],
            Some(node_id),
        );
    }

    /// Asks a node to rediscover its neighbors.
    pub fn request_node_neighbor_update(&self, node_id: u8) {
        self.command_with_callback(
            MessageClass::RequestNodeNeighborUpdate,
            vec![node_id],
            Some(node_id),
        );
    }

    /// Puts the controller into inclusion mode.
    pub fn request_add_nodes_start(&self) {
        self.command_with_callback(
            MessageClass::AddNode,
            vec![NODE_ANY | OPTION_HIGH_POWER | OPTION_NETWORK_WIDE],
            None,
        );
    }

    /// Leaves inclusion mode.
    pub fn request_add_nodes_stop(&self) {
        self.command_with_callback(MessageClass::AddNode, vec![NODE_STOP], None);
    }

    /// Puts the controller into exclusion mode.
    pub fn request_remove_nodes_start(&self) {
        self.command_with_callback(
            MessageClass::RemoveNode,
            vec![NODE_ANY | OPTION_HIGH_POWER],
            None,
        );
    }

    /// Leaves exclusion mode.
    pub fn request_remove_nodes_stop(&self) {
        self.command_with_callback(MessageClass::RemoveNode, vec![NODE_STOP], None);
    }

    /// Removes a node that has been marked as failed.
    pub fn request_remove_failed_node(&self, node_id: u8) {
        self.command_with_callback(MessageClass::RemoveFailedNode, vec![node_id], Some(node_id));
    }

    /// Deletes all return routes of a node.
    pub fn request_delete_all_return_routes(&self, node_id: u8) {
        self.command_with_callback(MessageClass::DeleteReturnRoute, vec![node_id], Some(node_id));
    }

    /// Assigns a return route from `source_node` to `destination_node`.
    pub fn request_assign_return_route(&self, source_node: u8, destination_node: u8) {
        self.command_with_callback(
            MessageClass::AssignReturnRoute,
            vec![source_node, destination_node],
            Some(source_node),
        );
    }

    /// Assigns a return route from `source_node` to the static update
    /// controller.
    pub fn request_assign_suc_return_route(&self, source_node: u8) {
        self.command_with_callback(
            MessageClass::AssignSucReturnRoute,
            vec![source_node],
            Some(source_node),
        );
    }

    /// Resets the Z-Wave module without touching the network configuration.
    pub fn soft_reset(&self) {
        self.command(MessageClass::SerialApiSoftReset, Vec::new(), None);
    }

    /// Validates and enqueues an application data send.
    ///
    /// Sets the standard transmit options, assigns the callback ID and
    /// composes the wire payload. If the target node is asleep, the message
    /// goes to that node's wake-up queue instead of the send queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMessage`] if the message is not a SendData
    /// request, has no target node or carries too much data.
    pub fn send_data(&self, mut message: SerialMessage) -> Result<(), Error> {
        if message.class != MessageClass::SendData {
            return Err(Error::InvalidMessage("SendData class expected"));
        }

        if message.message_type != MessageType::Request {
            return Err(Error::InvalidMessage("SendData must be a request"));
        }

        let Some(node_id) = message.target_node else {
            return Err(Error::InvalidMessage("SendData requires a target node"));
        };

        // Node ID, data length, transmit options and callback ID surround
        // the data on the wire.
        if message.payload.len() > MAX_PAYLOAD_SIZE - 4 {
            return Err(Error::InvalidMessage("SendData payload too large"));
        }

        message.transmit_options = TransmitOptions::standard();
        message.callback_id = self.shared.state.next_callback_id();
        message.attempts_remaining = self.shared.options.send_attempts;

        let data = std::mem::take(&mut message.payload);
        let mut payload = Vec::with_capacity(data.len() + 4);
        payload.push(node_id);
        payload.push(data.len() as u8);
        payload.extend_from_slice(&data);
        payload.push(message.transmit_options.bits());
        payload.push(message.callback_id);
        message.payload = payload;

        self.shared.nodes.with_node(node_id, |node| node.send_count += 1);

        if message.priority != Priority::Low && self.shared.nodes.is_asleep(node_id) {
            self.shared
                .nodes
                .with_node(node_id, |node| node.defer_until_wake_up(message));
            return Ok(());
        }

        self.shared.queue.push(message);
        Ok(())
    }

    /// Appends a prebuilt message to the send queue.
    ///
    /// This is the raw submission path for externally registered message
    /// processors; the typed commands above should cover everything else.
    pub fn enqueue(&self, message: SerialMessage) {
        self.shared.queue.push(message);
    }

    /// Marks a battery node awake and moves its deferred messages onto the
    /// send queue.
    pub fn mark_node_awake(&self, node_id: u8) {
        let deferred = self.shared.nodes.with_node(node_id, |node| {
            node.awake = true;
            node.drain_wake_up_queue()
        });

        let Some(deferred) = deferred else {
            return;
        };

        debug!(
            "Node {node_id} woke up; releasing {} deferred message(s).",
            deferred.len()
        );

        for message in deferred {
            self.shared.queue.push(message);
        }

        self.shared.listeners.emit(&Event::NodeStatus {
            node_id,
            state: NodeState::Awake,
        });
    }

    /// Marks a battery node asleep again.
    pub fn mark_node_asleep(&self, node_id: u8) {
        if self
            .shared
            .nodes
            .with_node(node_id, |node| node.awake = false)
            .is_some()
        {
            self.shared.listeners.emit(&Event::NodeStatus {
                node_id,
                state: NodeState::Asleep,
            });
        }
    }

    /// Runs the dead-node policy: declares nodes dead whose interview
    /// stalled, and finishes initialization if nothing else is pending.
    pub fn check_for_dead_nodes(&self) {
        self.shared.check_for_dead_nodes();
    }

    // --- helpers ---------------------------------------------------------

    fn command(&self, class: MessageClass, payload: Vec<u8>, target_node: Option<u8>) {
        let mut message =
            SerialMessage::request(class, payload).with_priority(Priority::High);
        message.target_node = target_node;
        message.attempts_remaining = self.shared.options.send_attempts;
        self.shared.queue.push(message);
    }

    fn command_with_callback(
        &self,
        class: MessageClass,
        mut payload: Vec<u8>,
        target_node: Option<u8>,
    ) {
        let callback_id = self.shared.state.next_callback_id();
        payload.push(callback_id);

        let mut message =
            SerialMessage::request(class, payload).with_priority(Priority::High);
        message.callback_id = callback_id;
        message.target_node = target_node;
        message.attempts_remaining = self.shared.options.send_attempts;
        self.shared.queue.push(message);
    }
}

impl<W> Drop for Controller<W> {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            self.shared.stop();
            self.shared.link.disconnect();
            let _ = watchdog.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{Controller, Options};
    use crate::event::recording::Recorder;
    use crate::event::Event;
    use crate::frame::DataFrame;
    use crate::message::{MessageClass, MessageType, Priority, SerialMessage};
    use crate::node::Node;
    use crate::port::mock::{self, frames_of_class, MockReader, MockWriter, Stick};

    fn start() -> (Controller<MockWriter>, Stick) {
        let (stick, reader, writer) = mock::pair(Duration::from_millis(10));
        let controller =
            Controller::start::<MockReader>(reader, writer, Options::default(), None);
        (controller, stick)
    }

    fn wait_for_frame(stick: &Stick, class: MessageClass) {
        assert!(
            stick.wait_for_write(Duration::from_secs(2), |bytes| {
                frames_of_class(bytes, class) >= 1
            }),
            "no {class:?} frame was written"
        );
    }

    fn respond(stick: &Stick, class: MessageClass, payload: &[u8]) {
        let mut bytes = vec![0x06];
        bytes.extend_from_slice(
            &DataFrame::new(MessageType::Response, class, payload)
                .to_bytes()
                .unwrap(),
        );
        stick.send(bytes);
    }

    fn wait_until(deadline_message: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);

        while !condition() {
            assert!(Instant::now() < deadline, "{deadline_message}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_full_initialization_handshake() {
        let (mut controller, stick) = start();
        let recorder = Recorder::new();
        controller.add_event_listener(recorder.clone());

        controller.initialize();

        wait_for_frame(&stick, MessageClass::GetVersion);
        respond(&stick, MessageClass::GetVersion, b"Z-Wave 2.78\x00\x01");

        wait_for_frame(&stick, MessageClass::MemoryGetId);
        respond(
            &stick,
            MessageClass::MemoryGetId,
            &[0xC0, 0x12, 0x34, 0x56, 0x01],
        );

        wait_for_frame(&stick, MessageClass::SerialApiGetCapabilities);
        let mut capabilities = vec![0x01, 0x00, 0x00, 0x86, 0x00, 0x02, 0x00, 0x64];
        capabilities.extend_from_slice(&[0u8; 32]);
        respond(&stick, MessageClass::SerialApiGetCapabilities, &capabilities);

        // The capabilities response chains into the node enumeration.
        wait_for_frame(&stick, MessageClass::SerialApiGetInitData);
        let mut init_data = vec![0x05, 0x00, 29];
        let mut mask = [0u8; 29];
        mask[0] = 0b0000_0001; // only our own node
        init_data.extend_from_slice(&mask);
        init_data.extend_from_slice(&[0x05, 0x00]);
        respond(&stick, MessageClass::SerialApiGetInitData, &init_data);

        wait_until("initialization did not complete", || {
            recorder.count(|e| matches!(e, Event::InitializationCompleted(1))) == 1
        });

        assert_eq!(controller.library_version(), "Z-Wave 2.78");
        assert_eq!(controller.serial_api_version(), "1.0");
        assert_eq!(controller.home_id(), 0xC0123456);
        assert_eq!(controller.own_node_id(), 1);
        assert_eq!(controller.manufacturer_id(), 0x0086);
        assert_eq!(controller.node_ids(), vec![1]);
        assert!(controller.is_connected());

        // Four transactions: version, IDs, capabilities and init data.
        wait_until("not all transactions completed", || {
            recorder.count(|e| matches!(e, Event::TransactionCompleted(_))) == 4
        });

        controller.close();
        assert!(!controller.is_connected());
    }

    #[test]
    fn test_send_data_validation() {
        let (mut controller, _stick) = start();

        // Wrong class.
        let wrong = SerialMessage::request(MessageClass::GetVersion, []);
        assert!(controller.send_data(wrong).is_err());

        // Missing target.
        let untargeted = SerialMessage::request(MessageClass::SendData, [0x20, 0x01]);
        assert!(controller.send_data(untargeted).is_err());

        controller.close();
    }

    #[test]
    fn test_send_data_composes_wire_payload() {
        let (mut controller, stick) = start();

        let message = SerialMessage::request(MessageClass::SendData, [0x20, 0x01, 0x00])
            .with_priority(Priority::Set)
            .with_target(5);
        controller.send_data(message).unwrap();

        wait_for_frame(&stick, MessageClass::SendData);

        let written = stick.written();
        // Skip the resync NAK, then: SOF LEN TYPE CLASS node len data... opts cb
        let start = written.iter().position(|byte| *byte == 0x01).unwrap();
        let frame = &written[start..];
        assert_eq!(frame[2], 0x00); // request
        assert_eq!(frame[3], 0x13); // SendData
        assert_eq!(frame[4], 5); // node
        assert_eq!(frame[5], 3); // data length
        assert_eq!(&frame[6..9], &[0x20, 0x01, 0x00]);
        assert_eq!(frame[9], 0x25); // ACK | AUTO_ROUTE | EXPLORE
        assert_eq!(frame[10], 1); // first callback ID

        controller.close();
    }

    #[test]
    fn test_send_data_callback_ids_are_distinct() {
        let (mut controller, _stick) = start();

        // A sleeping node collects the messages, so their callback IDs can
        // be inspected without racing the engine.
        let mut node = Node::new(7);
        node.protocol_info_known = true;
        controller.shared.nodes.add(node);

        for _ in 0..3 {
            let message =
                SerialMessage::request(MessageClass::SendData, [0x20, 0x02]).with_target(7);
            controller.send_data(message).unwrap();
        }

        let deferred = controller
            .shared
            .nodes
            .with_node(7, |node| node.drain_wake_up_queue())
            .unwrap();

        let ids: Vec<u8> = deferred.iter().map(|message| message.callback_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        for message in &deferred {
            // The callback ID is also the last wire payload byte.
            assert_eq!(message.payload.last(), Some(&message.callback_id));
        }

        assert_eq!(
            controller.shared.nodes.with_node(7, |node| node.send_count),
            Some(3)
        );

        controller.close();
    }

    #[test]
    fn test_send_data_to_sleeping_node_is_deferred() {
        let (mut controller, stick) = start();

        let mut node = Node::new(7);
        node.protocol_info_known = true;
        controller.shared.nodes.add(node);

        let message = SerialMessage::request(MessageClass::SendData, [0x20, 0x02])
            .with_priority(Priority::Get)
            .with_target(7);
        controller.send_data(message).unwrap();

        assert_eq!(controller.send_queue_length(), 0);
        assert_eq!(
            controller
                .shared
                .nodes
                .with_node(7, |node| node.wake_up_queue_len()),
            Some(1)
        );

        // Waking the node releases the message onto the queue and wire.
        controller.mark_node_awake(7);
        wait_for_frame(&stick, MessageClass::SendData);

        controller.close();
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut controller, _stick) = start();
        controller.close();
        controller.close();
        assert!(!controller.is_connected());
        assert_eq!(controller.send_queue_length(), 0);
    }
}
