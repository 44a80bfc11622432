//! SerialApiGetInitData response processing.

use log::{debug, info, warn};

use super::{HandlerContext, MessageHandler, Outcome};
use crate::frame::DataFrame;
use crate::message::{MessageClass, MessageType, Priority, SerialMessage};
use crate::node::{Node, NodeStage};

/// Creates the node registry entries from the init data response and starts
/// the per-node interview.
///
/// The payload is: API version, capability bits, the node bitmask length,
/// the node bitmask (bit 0 of the first byte is node 1), then chip type and
/// version.
pub struct InitDataHandler;

impl MessageHandler for InitDataHandler {
    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        _in_flight: Option<&SerialMessage>,
        frame: &DataFrame,
    ) -> Outcome {
        if frame.message_type() != MessageType::Response {
            return Outcome::Pending;
        }

        let [_api_version, _capabilities, mask_len, rest @ ..] = frame.payload() else {
            warn!("Short init data response: {frame}");
            return Outcome::Complete;
        };

        let Some(mask) = rest.get(..*mask_len as usize) else {
            warn!("Init data node bitmask is truncated: {frame}");
            return Outcome::Complete;
        };

        let (own_node_id, home_id) = ctx
            .state
            .read_info(|node_info| (node_info.own_node_id, node_info.home_id));
        let mut present = 0usize;

        for (index, byte) in mask.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) == 0 {
                    continue;
                }

                let node_id = (index * 8 + bit + 1) as u8;
                present += 1;

                let mut node = Node::new(node_id);
                node.home_id = home_id;

                if node_id == own_node_id {
                    // Our own node never needs an interview; it is fully
                    // described by the capabilities we already hold.
                    node.listening = true;
                    node.set_stage(NodeStage::Done);
                } else {
                    node.set_stage(NodeStage::ProtocolInfo);
                }

                if !ctx.nodes.add(node) {
                    debug!("Node {node_id} already known.");
                    continue;
                }

                if node_id != own_node_id {
                    ctx.queue.push(
                        SerialMessage::request(MessageClass::IdentifyNode, [node_id])
                            .with_priority(Priority::High)
                            .with_target(node_id),
                    );
                }
            }
        }

        info!("Network has {present} node(s).");

        // A network of only terminal nodes (e.g. just the controller) has
        // nothing left to interview.
        ctx.finish_initialization_if_complete();

        Outcome::Complete
    }
}
