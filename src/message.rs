//! Outbound and inbound Serial API messages.

use std::time::Instant;

use bitflags::bitflags;

/// Function identifiers of the Serial API commands this driver speaks.
///
/// The wire values are the function IDs of the Z-Wave Serial API. Commands
/// the driver never touches are not listed; frames carrying them are logged
/// and ignored.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum MessageClass {
    /// Query the API version, capabilities and node bitmask.
    SerialApiGetInitData = 0x02,
    /// A command class frame sent to us by another node.
    ApplicationCommand = 0x04,
    /// Query the serial API capabilities of the controller.
    SerialApiGetCapabilities = 0x07,
    /// Reset the Z-Wave module without erasing the network.
    SerialApiSoftReset = 0x08,
    /// Sent by the controller after its serial API has (re)started.
    SerialApiStarted = 0x0A,
    /// Send a data payload to a node.
    SendData = 0x13,
    /// Query the library version and type.
    GetVersion = 0x15,
    /// Abort an in-progress SendData transmission.
    SendDataAbort = 0x16,
    /// Query the home ID and our own node ID.
    MemoryGetId = 0x20,
    /// Query protocol information (listening, device class) for a node.
    IdentifyNode = 0x41,
    /// Assign a return route from one node to another.
    AssignReturnRoute = 0x46,
    /// Delete all return routes of a node.
    DeleteReturnRoute = 0x47,
    /// Ask a node to rediscover its neighbors.
    RequestNodeNeighborUpdate = 0x48,
    /// Asynchronous node information update from the controller.
    ApplicationUpdate = 0x49,
    /// Control the inclusion process.
    AddNode = 0x4A,
    /// Control the exclusion process.
    RemoveNode = 0x4B,
    /// Assign a return route towards the static update controller.
    AssignSucReturnRoute = 0x51,
    /// Ask a node for its node information frame.
    RequestNodeInfo = 0x60,
    /// Remove a node that has been marked as failed.
    RemoveFailedNode = 0x61,
    /// Read a node's neighbor list from the controller.
    GetRoutingInfo = 0x80,
}

impl TryFrom<u8> for MessageClass {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x02 => Ok(Self::SerialApiGetInitData),
            0x04 => Ok(Self::ApplicationCommand),
            0x07 => Ok(Self::SerialApiGetCapabilities),
            0x08 => Ok(Self::SerialApiSoftReset),
            0x0A => Ok(Self::SerialApiStarted),
            0x13 => Ok(Self::SendData),
            0x15 => Ok(Self::GetVersion),
            0x16 => Ok(Self::SendDataAbort),
            0x20 => Ok(Self::MemoryGetId),
            0x41 => Ok(Self::IdentifyNode),
            0x46 => Ok(Self::AssignReturnRoute),
            0x47 => Ok(Self::DeleteReturnRoute),
            0x48 => Ok(Self::RequestNodeNeighborUpdate),
            0x49 => Ok(Self::ApplicationUpdate),
            0x4A => Ok(Self::AddNode),
            0x4B => Ok(Self::RemoveNode),
            0x51 => Ok(Self::AssignSucReturnRoute),
            0x60 => Ok(Self::RequestNodeInfo),
            0x61 => Ok(Self::RemoveFailedNode),
            0x80 => Ok(Self::GetRoutingInfo),
            other => Err(other),
        }
    }
}

impl From<MessageClass> for u8 {
    fn from(class: MessageClass) -> Self {
        class as Self
    }
}

/// Direction marker of a data frame.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum MessageType {
    /// Host-initiated command, or an asynchronous callback from the stick.
    Request = 0x00,
    /// The stick's immediate answer to a request.
    Response = 0x01,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x00 => Ok(Self::Request),
            0x01 => Ok(Self::Response),
            other => Err(other),
        }
    }
}

/// Send priority of a queued message.
///
/// The send queue delivers higher priorities first and is FIFO within one
/// priority. `Low` marks messages destined for battery-operated nodes that
/// are held back until the target wakes up.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Priority {
    /// Protocol-critical traffic (initialization, aborts, retries).
    High,
    /// State-changing commands.
    Set,
    /// State queries.
    Get,
    /// Traffic for sleeping nodes.
    Low,
}

bitflags! {
    /// Transmit options of a SendData request.
    #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
    pub struct TransmitOptions: u8 {
        /// Request a routed acknowledgement from the target.
        const ACK = 0x01;
        /// Let the protocol route through repeaters if needed.
        const AUTO_ROUTE = 0x04;
        /// Allow explorer frames as a routing fallback.
        const EXPLORE = 0x20;
    }
}

impl TransmitOptions {
    /// The option set used for ordinary sends.
    #[must_use]
    pub const fn standard() -> Self {
        Self::ACK.union(Self::AUTO_ROUTE).union(Self::EXPLORE)
    }
}

/// A single outbound Serial API message.
#[derive(Clone, Debug)]
pub struct SerialMessage {
    /// Function this message invokes.
    pub class: MessageClass,
    /// Request or response.
    pub message_type: MessageType,
    /// Queue priority.
    pub priority: Priority,
    /// Raw frame payload (everything between the class byte and checksum).
    pub payload: Vec<u8>,
    /// The node this message is addressed to, if any.
    pub target_node: Option<u8>,
    /// Callback ID echoed by the stick's asynchronous completion, `0` if none.
    pub callback_id: u8,
    /// Transmit options for SendData-class messages.
    pub transmit_options: TransmitOptions,
    /// How many more delivery attempts this message gets after a failure.
    pub attempts_remaining: u8,
    /// Queue insertion order, assigned on first enqueue. `0` means unassigned.
    pub(crate) sequence: u64,
    /// When this message was created.
    pub created: Instant,
}

impl SerialMessage {
    /// Default number of delivery attempts.
    pub const DEFAULT_ATTEMPTS: u8 = 3;

    /// Creates a new request message with `Get` priority and an empty target.
    #[must_use]
    pub fn request(class: MessageClass, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            class,
            message_type: MessageType::Request,
            priority: Priority::Get,
            payload: payload.into(),
            target_node: None,
            callback_id: 0,
            transmit_options: TransmitOptions::empty(),
            attempts_remaining: Self::DEFAULT_ATTEMPTS,
            sequence: 0,
            created: Instant::now(),
        }
    }

    /// Sets the queue priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the target node.
    #[must_use]
    pub fn with_target(mut self, node_id: u8) -> Self {
        self.target_node = Some(node_id);
        self
    }
}
