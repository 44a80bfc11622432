//! Message processors: per-class interpretation of received frames.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::event::Event;
use crate::frame::DataFrame;
use crate::message::{MessageClass, SerialMessage};
use crate::node::NodeRegistry;
use crate::queue::SendQueue;
use crate::state::ControllerState;

pub use application::{ApplicationCommandHandler, SerialApiStartedHandler};
pub use capabilities::CapabilitiesHandler;
pub use controller_id::ControllerIdHandler;
pub use init_data::InitDataHandler;
pub use network::{
    AddNodeHandler, NeighborUpdateHandler, RemoveFailedNodeHandler, RemoveNodeHandler,
    ReturnRouteHandler, RoutingInfoHandler,
};
pub use node_info::{ApplicationUpdateHandler, NodeInfoHandler};
pub use protocol_info::ProtocolInfoHandler;
pub use send_data::SendDataHandler;
pub use version::VersionHandler;

mod application;
mod capabilities;
mod controller_id;
mod init_data;
mod network;
mod node_info;
mod protocol_info;
mod send_data;
mod version;

/// Whether a processed frame completed the in-flight transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The transaction is finished; the engine may move on.
    Complete,
    /// The transaction is still waiting for more frames (or the frame was
    /// unrelated to it).
    Pending,
}

/// Everything a handler may act upon.
///
/// Handlers run on the receive thread; all side effects go through these
/// shared structures.
pub struct HandlerContext<'a> {
    /// The send queue, for follow-up commands.
    pub queue: &'a SendQueue,
    /// The node registry.
    pub nodes: &'a NodeRegistry,
    /// Controller identity and counters.
    pub state: &'a ControllerState,
    listeners: &'a crate::event::Listeners,
}

impl<'a> HandlerContext<'a> {
    pub(crate) const fn new(
        queue: &'a SendQueue,
        nodes: &'a NodeRegistry,
        state: &'a ControllerState,
        listeners: &'a crate::event::Listeners,
    ) -> Self {
        Self {
            queue,
            nodes,
            state,
            listeners,
        }
    }

    /// Delivers an event to all subscribers.
    pub fn emit(&self, event: &Event) {
        self.listeners.emit(event);
    }

    /// Emits [`Event::InitializationCompleted`] if every node has reached a
    /// final state and it has not been emitted before.
    pub fn finish_initialization_if_complete(&self) {
        if self.nodes.all_complete() && self.state.complete_initialization() {
            let own_node_id = self.state.read_info(|info| info.own_node_id);
            log::info!("Initialization complete.");
            self.emit(&Event::InitializationCompleted(own_node_id));
        }
    }
}

/// A processor for one message class.
///
/// The processor receives the frame together with the message currently in
/// flight (if any) and reports whether that transaction is now complete.
/// Implementations must tolerate unsolicited frames.
pub trait MessageHandler: Send + Sync {
    /// Processes a received frame.
    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        in_flight: Option<&SerialMessage>,
        frame: &DataFrame,
    ) -> Outcome;
}

/// Dispatch table from message class to processor.
///
/// Consumers may replace any entry, e.g. to hook an application-command
/// decoder into the driver.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<u8, Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with all built-in processors installed.
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();

        registry.register(MessageClass::GetVersion, Arc::new(VersionHandler));
        registry.register(MessageClass::MemoryGetId, Arc::new(ControllerIdHandler));
        registry.register(
            MessageClass::SerialApiGetCapabilities,
            Arc::new(CapabilitiesHandler),
        );
        registry.register(MessageClass::SerialApiGetInitData, Arc::new(InitDataHandler));
        registry.register(MessageClass::IdentifyNode, Arc::new(ProtocolInfoHandler));
        registry.register(MessageClass::RequestNodeInfo, Arc::new(NodeInfoHandler));
        registry.register(
            MessageClass::ApplicationUpdate,
            Arc::new(ApplicationUpdateHandler),
        );
        registry.register(MessageClass::SendData, Arc::new(SendDataHandler));
        registry.register(
            MessageClass::SerialApiStarted,
            Arc::new(SerialApiStartedHandler),
        );
        registry.register(
            MessageClass::ApplicationCommand,
            Arc::new(ApplicationCommandHandler),
        );
        registry.register(MessageClass::AddNode, Arc::new(AddNodeHandler));
        registry.register(MessageClass::RemoveNode, Arc::new(RemoveNodeHandler));
        registry.register(
            MessageClass::RemoveFailedNode,
            Arc::new(RemoveFailedNodeHandler),
        );
        registry.register(
            MessageClass::RequestNodeNeighborUpdate,
            Arc::new(NeighborUpdateHandler),
        );
        registry.register(MessageClass::GetRoutingInfo, Arc::new(RoutingInfoHandler));

        let return_routes = Arc::new(ReturnRouteHandler);
        registry.register(MessageClass::AssignReturnRoute, return_routes.clone());
        registry.register(MessageClass::AssignSucReturnRoute, return_routes.clone());
        registry.register(MessageClass::DeleteReturnRoute, return_routes);

        registry
    }

    /// Installs (or replaces) the processor for a message class.
    pub fn register(&self, class: MessageClass, handler: Arc<dyn MessageHandler>) {
        self.handlers
            .write()
            .expect("handler registry lock poisoned")
            .insert(class.into(), handler);
    }

    /// Dispatches a frame to the processor registered for its class.
    ///
    /// Returns `None` if no processor is registered.
    pub fn dispatch(
        &self,
        ctx: &HandlerContext<'_>,
        in_flight: Option<&SerialMessage>,
        frame: &DataFrame,
    ) -> Option<Outcome> {
        let handler = self
            .handlers
            .read()
            .expect("handler registry lock poisoned")
            .get(&frame.class())
            .cloned()?;

        Some(handler.handle(ctx, in_flight, frame))
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field(
                "classes",
                &self
                    .handlers
                    .read()
                    .expect("handler registry lock poisoned")
                    .len(),
            )
            .finish()
    }
}
