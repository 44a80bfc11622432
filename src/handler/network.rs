//! Network management callbacks: inclusion, exclusion, failed nodes,
//! neighbors and return routes.

use log::{debug, info, warn};

use super::{HandlerContext, MessageHandler, Outcome};
use crate::event::Event;
use crate::frame::DataFrame;
use crate::message::{MessageClass, MessageType, Priority, SerialMessage};
use crate::node::{Node, NodeStage};

/// AddNode/RemoveNode status: a slave node is being processed.
const NODE_STATUS_SLAVE: u8 = 0x03;
/// AddNode/RemoveNode status: a controller node is being processed.
const NODE_STATUS_CONTROLLER: u8 = 0x04;
/// AddNode/RemoveNode status: the operation finished.
const NODE_STATUS_DONE: u8 = 0x06;
/// AddNode/RemoveNode status: the operation failed.
const NODE_STATUS_FAILED: u8 = 0x07;

/// RemoveFailedNode callback status: the node was removed.
const FAILED_NODE_REMOVED: u8 = 0x01;

/// RequestNodeNeighborUpdate callback status: update finished.
const NEIGHBOR_UPDATE_DONE: u8 = 0x22;
/// RequestNodeNeighborUpdate callback status: update failed.
const NEIGHBOR_UPDATE_FAILED: u8 = 0x23;

fn matches_in_flight(
    in_flight: Option<&SerialMessage>,
    class: MessageClass,
    callback_id: u8,
) -> bool {
    in_flight.is_some_and(|message| {
        message.class == class && (message.callback_id == 0 || message.callback_id == callback_id)
    })
}

/// Drives the inclusion process.
pub struct AddNodeHandler;

impl MessageHandler for AddNodeHandler {
    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        in_flight: Option<&SerialMessage>,
        frame: &DataFrame,
    ) -> Outcome {
        let [callback_id, status, rest @ ..] = frame.payload() else {
            warn!("Short AddNode callback: {frame}");
            return Outcome::Pending;
        };

        match *status {
            NODE_STATUS_SLAVE | NODE_STATUS_CONTROLLER => {
                if let Some(node_id) = rest.first().copied().filter(|id| *id != 0) {
                    info!("Node {node_id} is joining the network.");

                    let mut node = Node::new(node_id);
                    node.home_id = ctx.state.read_info(|info| info.home_id);
                    node.set_stage(NodeStage::ProtocolInfo);

                    if ctx.nodes.add(node) {
                        ctx.queue.push(
                            SerialMessage::request(MessageClass::IdentifyNode, [node_id])
                                .with_priority(Priority::High)
                                .with_target(node_id),
                        );
                        ctx.emit(&Event::NodeAdded(node_id));
                    }
                }

                Outcome::Pending
            }
            NODE_STATUS_DONE => {
                if matches_in_flight(in_flight, MessageClass::AddNode, *callback_id) {
                    Outcome::Complete
                } else {
                    Outcome::Pending
                }
            }
            NODE_STATUS_FAILED => {
                warn!("Inclusion failed.");
                if matches_in_flight(in_flight, MessageClass::AddNode, *callback_id) {
                    Outcome::Complete
                } else {
                    Outcome::Pending
                }
            }
            status => {
                debug!("Inclusion status {status:#04X}.");
                Outcome::Pending
            }
        }
    }
}

/// Drives the exclusion process.
pub struct RemoveNodeHandler;

impl MessageHandler for RemoveNodeHandler {
    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        in_flight: Option<&SerialMessage>,
        frame: &DataFrame,
    ) -> Outcome {
        let [callback_id, status, rest @ ..] = frame.payload() else {
            warn!("Short RemoveNode callback: {frame}");
            return Outcome::Pending;
        };

        match *status {
            NODE_STATUS_SLAVE | NODE_STATUS_CONTROLLER => {
                if let Some(node_id) = rest.first().copied().filter(|id| *id != 0) {
                    info!("Node {node_id} is leaving the network.");

                    if ctx.nodes.remove(node_id) {
                        ctx.emit(&Event::NodeRemoved(node_id));
                    }
                }

                Outcome::Pending
            }
            NODE_STATUS_DONE | NODE_STATUS_FAILED => {
                if *status == NODE_STATUS_FAILED {
                    warn!("Exclusion failed.");
                }

                if matches_in_flight(in_flight, MessageClass::RemoveNode, *callback_id) {
                    Outcome::Complete
                } else {
                    Outcome::Pending
                }
            }
            status => {
                debug!("Exclusion status {status:#04X}.");
                Outcome::Pending
            }
        }
    }
}

/// Drives the removal of a failed node.
pub struct RemoveFailedNodeHandler;

impl MessageHandler for RemoveFailedNodeHandler {
    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        in_flight: Option<&SerialMessage>,
        frame: &DataFrame,
    ) -> Outcome {
        match frame.message_type() {
            MessageType::Response => {
                let started = frame.payload().first().is_some_and(|byte| *byte == 0);

                if started {
                    Outcome::Pending
                } else {
                    warn!("RemoveFailedNode was rejected by the stick.");
                    Outcome::Complete
                }
            }
            MessageType::Request => {
                let [callback_id, status, ..] = frame.payload() else {
                    warn!("Short RemoveFailedNode callback: {frame}");
                    return Outcome::Pending;
                };

                if !matches_in_flight(in_flight, MessageClass::RemoveFailedNode, *callback_id) {
                    return Outcome::Pending;
                }

                if *status == FAILED_NODE_REMOVED {
                    if let Some(node_id) = in_flight.and_then(|message| message.target_node) {
                        info!("Failed node {node_id} removed.");

                        if ctx.nodes.remove(node_id) {
                            ctx.emit(&Event::NodeRemoved(node_id));
                        }
                    }
                } else {
                    warn!("Failed node was not removed: status {status:#04X}.");
                }

                Outcome::Complete
            }
        }
    }
}

/// Completes neighbor update requests.
pub struct NeighborUpdateHandler;

impl MessageHandler for NeighborUpdateHandler {
    fn handle(
        &self,
        _ctx: &HandlerContext<'_>,
        in_flight: Option<&SerialMessage>,
        frame: &DataFrame,
    ) -> Outcome {
        match frame.message_type() {
            MessageType::Response => {
                // A single retval byte; the result arrives as a callback.
                Outcome::Pending
            }
            MessageType::Request => {
                let [callback_id, status, ..] = frame.payload() else {
                    warn!("Short neighbor update callback: {frame}");
                    return Outcome::Pending;
                };

                match *status {
                    NEIGHBOR_UPDATE_DONE | NEIGHBOR_UPDATE_FAILED => {
                        if *status == NEIGHBOR_UPDATE_FAILED {
                            warn!("Neighbor update failed.");
                        }

                        if matches_in_flight(
                            in_flight,
                            MessageClass::RequestNodeNeighborUpdate,
                            *callback_id,
                        ) {
                            Outcome::Complete
                        } else {
                            Outcome::Pending
                        }
                    }
                    status => {
                        debug!("Neighbor update status {status:#04X}.");
                        Outcome::Pending
                    }
                }
            }
        }
    }
}

/// Stores a node's neighbor list from a GetRoutingInfo response.
pub struct RoutingInfoHandler;

impl MessageHandler for RoutingInfoHandler {
    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        in_flight: Option<&SerialMessage>,
        frame: &DataFrame,
    ) -> Outcome {
        if frame.message_type() != MessageType::Response {
            return Outcome::Pending;
        }

        let node_id = match in_flight {
            Some(message) if message.class == MessageClass::GetRoutingInfo => message.target_node,
            _ => None,
        };

        let Some(node_id) = node_id else {
            warn!("Routing info response without a matching request: {frame}");
            return Outcome::Complete;
        };

        let mut neighbors = Vec::new();

        for (index, byte) in frame.payload().iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    neighbors.push((index * 8 + bit + 1) as u8);
                }
            }
        }

        debug!("Node {node_id} neighbors: {neighbors:?}");
        ctx.nodes.with_node(node_id, |node| node.neighbors = neighbors);

        Outcome::Complete
    }
}

/// Completes return route assignments and deletions.
pub struct ReturnRouteHandler;

impl MessageHandler for ReturnRouteHandler {
    fn handle(
        &self,
        _ctx: &HandlerContext<'_>,
        in_flight: Option<&SerialMessage>,
        frame: &DataFrame,
    ) -> Outcome {
        let Some(class) = frame.message_class() else {
            return Outcome::Pending;
        };

        match frame.message_type() {
            MessageType::Response => {
                let started = frame.payload().first().is_some_and(|byte| *byte != 0);

                if started {
                    Outcome::Pending
                } else {
                    warn!("{class:?} was rejected by the stick.");
                    Outcome::Complete
                }
            }
            MessageType::Request => {
                let [callback_id, status, ..] = frame.payload() else {
                    warn!("Short {class:?} callback: {frame}");
                    return Outcome::Pending;
                };

                if *status != 0 {
                    warn!("{class:?} finished with status {status:#04X}.");
                }

                if matches_in_flight(in_flight, class, *callback_id) {
                    Outcome::Complete
                } else {
                    Outcome::Pending
                }
            }
        }
    }
}
