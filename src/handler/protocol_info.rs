//! IdentifyNode (protocol info) response processing.

use log::{debug, warn};

use super::{HandlerContext, MessageHandler, Outcome};
use crate::frame::DataFrame;
use crate::message::{MessageClass, MessageType, Priority, SerialMessage};
use crate::node::NodeStage;

/// Listening bit in the first capability byte.
const CAPABILITY_LISTENING: u8 = 0x80;
/// Beam wake-up bits (250 ms / 1000 ms) in the security byte.
const SECURITY_FLIRS: u8 = 0x60;

/// Stores a node's protocol information and advances its interview.
///
/// The response does not echo the node ID; it is correlated through the
/// in-flight IdentifyNode request. The payload is: capability byte,
/// security byte, a reserved byte, then the basic, generic and specific
/// device class.
pub struct ProtocolInfoHandler;

impl MessageHandler for ProtocolInfoHandler {
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
            Some(message) if message.class == MessageClass::IdentifyNode => message.target_node,
            _ => None,
        };

        let Some(node_id) = node_id else {
            warn!("Protocol info response without a matching request: {frame}");
            return Outcome::Complete;
        };

        let [capability, security, _reserved, basic, generic, specific, ..] = frame.payload()
        else {
            warn!("Short protocol info response for node {node_id}: {frame}");
            return Outcome::Complete;
        };

        let listening = capability & CAPABILITY_LISTENING != 0;
        let frequently_listening = security & SECURITY_FLIRS != 0;

        debug!(
            "Node {node_id}: listening={listening}, flirs={frequently_listening}, \
             class {basic:#04X}/{generic:#04X}/{specific:#04X}"
        );

        let known = ctx
            .nodes
            .with_node(node_id, |node| {
                node.protocol_info_known = true;
                node.listening = listening;
                node.frequently_listening = frequently_listening;
                node.basic_class = *basic;
                node.generic_class = *generic;
                node.specific_class = *specific;

                if listening || frequently_listening {
                    node.set_stage(NodeStage::NodeInfo);
                }
            })
            .is_some();

        if !known {
            warn!("Protocol info for unknown node {node_id}.");
            return Outcome::Complete;
        }

        if listening || frequently_listening {
            ctx.queue.push(
                SerialMessage::request(MessageClass::RequestNodeInfo, [node_id])
                    .with_priority(Priority::High)
                    .with_target(node_id),
            );
        } else {
            // Battery nodes cannot be interviewed on our schedule; they
            // count as complete right away.
            ctx.finish_initialization_if_complete();
        }

        Outcome::Complete
    }
}
