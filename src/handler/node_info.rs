//! RequestNodeInfo and ApplicationUpdate processing.

use log::{debug, warn};

use super::{HandlerContext, MessageHandler, Outcome};
use crate::event::{Event, NodeState};
use crate::frame::DataFrame;
use crate::message::{MessageClass, MessageType, SerialMessage};
use crate::node::NodeStage;

/// ApplicationUpdate status: a node information frame was received.
const UPDATE_NODE_INFO_RECEIVED: u8 = 0x84;
/// ApplicationUpdate status: the node information request failed.
const UPDATE_NODE_INFO_REQ_FAILED: u8 = 0x81;
/// Divider between supported and controlled command classes in a node
/// information frame.
const COMMAND_CLASS_MARK: u8 = 0xEF;

/// Handles the immediate response to RequestNodeInfo.
///
/// The response only says whether the stick accepted the request; the node
/// information itself arrives later as an ApplicationUpdate request.
pub struct NodeInfoHandler;

impl MessageHandler for NodeInfoHandler {
    fn handle(
        &self,
        _ctx: &HandlerContext<'_>,
        in_flight: Option<&SerialMessage>,
        frame: &DataFrame,
    ) -> Outcome {
        if frame.message_type() != MessageType::Response {
            return Outcome::Pending;
        }

        let accepted = frame.payload().first().is_some_and(|byte| *byte != 0);

        if accepted {
            // The stick will deliver the node information asynchronously.
            Outcome::Pending
        } else {
            let target = in_flight.and_then(|message| message.target_node);
            warn!("RequestNodeInfo was rejected by the stick (node {target:?}).");
            Outcome::Complete
        }
    }
}

/// Handles asynchronous node information updates from the stick.
pub struct ApplicationUpdateHandler;

impl MessageHandler for ApplicationUpdateHandler {
    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        in_flight: Option<&SerialMessage>,
        frame: &DataFrame,
    ) -> Outcome {
        if frame.message_type() != MessageType::Request {
            return Outcome::Pending;
        }

        match frame.payload() {
            [UPDATE_NODE_INFO_RECEIVED, node_id, _len, _basic, _generic, _specific, classes @ ..] =>
            {
                let node_id = *node_id;
                let supported = classes
                    .iter()
                    .copied()
                    .take_while(|class| *class != COMMAND_CLASS_MARK);

                let known = ctx
                    .nodes
                    .with_node(node_id, |node| {
                        node.command_classes.extend(supported);
                        node.set_stage(NodeStage::Done);
                    })
                    .is_some();

                if !known {
                    warn!("Node information for unknown node {node_id}.");
                    return Outcome::Pending;
                }

                debug!("Node {node_id} interview finished.");
                ctx.emit(&Event::NodeStatus {
                    node_id,
                    state: NodeState::Alive,
                });
                ctx.finish_initialization_if_complete();

                match in_flight {
                    Some(message)
                        if message.class == MessageClass::RequestNodeInfo
                            && message.target_node == Some(node_id) =>
                    {
                        Outcome::Complete
                    }
                    _ => Outcome::Pending,
                }
            }
            [UPDATE_NODE_INFO_REQ_FAILED, ..] => {
                // The failure does not carry a node ID; it can only belong
                // to the request currently in flight.
                match in_flight {
                    Some(message) if message.class == MessageClass::RequestNodeInfo => {
                        warn!(
                            "Node information request failed (node {:?}).",
                            message.target_node
                        );
                        Outcome::Complete
                    }
                    _ => Outcome::Pending,
                }
            }
            [status, ..] => {
                debug!("Unhandled application update status {status:#04X}.");
                Outcome::Pending
            }
            [] => {
                warn!("Empty application update.");
                Outcome::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ApplicationUpdateHandler, NodeInfoHandler, Outcome};
    use crate::event::recording::Recorder;
    use crate::event::{Event, Listeners, NodeState};
    use crate::frame::DataFrame;
    use crate::handler::{HandlerContext, MessageHandler};
    use crate::message::{MessageClass, MessageType, SerialMessage};
    use crate::node::{Node, NodeRegistry, NodeStage};
    use crate::queue::SendQueue;
    use crate::state::ControllerState;

    fn request_node_info(node_id: u8) -> SerialMessage {
        SerialMessage::request(MessageClass::RequestNodeInfo, [node_id]).with_target(node_id)
    }

    #[test]
    fn test_accepted_response_keeps_transaction_open() {
        let queue = SendQueue::new(8);
        let nodes = NodeRegistry::new();
        let state = ControllerState::new();
        let listeners = Listeners::new();
        let ctx = HandlerContext::new(&queue, &nodes, &state, &listeners);

        let frame = DataFrame::new(MessageType::Response, MessageClass::RequestNodeInfo, &[0x01]);
        assert_eq!(
            NodeInfoHandler.handle(&ctx, Some(&request_node_info(5)), &frame),
            Outcome::Pending
        );

        let rejected =
            DataFrame::new(MessageType::Response, MessageClass::RequestNodeInfo, &[0x00]);
        assert_eq!(
            NodeInfoHandler.handle(&ctx, Some(&request_node_info(5)), &rejected),
            Outcome::Complete
        );
    }

    #[test]
    fn test_node_info_received_completes_interview() {
        let queue = SendQueue::new(8);
        let nodes = NodeRegistry::new();
        let state = ControllerState::new();
        let listeners = Listeners::new();
        let recorder = Recorder::new();
        listeners.add(recorder.clone());
        let ctx = HandlerContext::new(&queue, &nodes, &state, &listeners);

        let mut node = Node::new(5);
        node.listening = true;
        node.set_stage(NodeStage::NodeInfo);
        nodes.add(node);

        // Node 5 supports Basic (0x20) and Binary Switch (0x25), controls
        // Basic (after the 0xEF mark).
        let frame = DataFrame::new(
            MessageType::Request,
            MessageClass::ApplicationUpdate,
            &[0x84, 5, 0x06, 0x04, 0x10, 0x01, 0x20, 0x25, 0xEF, 0x20],
        );

        let outcome = ApplicationUpdateHandler.handle(&ctx, Some(&request_node_info(5)), &frame);
        assert_eq!(outcome, Outcome::Complete);
        assert_eq!(nodes.with_node(5, |node| node.stage()), Some(NodeStage::Done));
        assert_eq!(
            nodes.with_node(5, |node| node.command_classes.clone()),
            Some([0x20, 0x25].into())
        );
        assert_eq!(
            recorder.count(|event| matches!(
                event,
                Event::NodeStatus {
                    node_id: 5,
                    state: NodeState::Alive
                }
            )),
            1
        );
    }

    #[test]
    fn test_unrelated_node_info_does_not_complete() {
        let queue = SendQueue::new(8);
        let nodes = NodeRegistry::new();
        let state = ControllerState::new();
        let listeners = Listeners::new();
        let ctx = HandlerContext::new(&queue, &nodes, &state, &listeners);

        let mut node = Node::new(6);
        node.listening = true;
        nodes.add(node);

        let frame = DataFrame::new(
            MessageType::Request,
            MessageClass::ApplicationUpdate,
            &[0x84, 6, 0x03, 0x04, 0x10, 0x01],
        );

        // We are waiting for node 5, the frame describes node 6.
        assert_eq!(
            ApplicationUpdateHandler.handle(&ctx, Some(&request_node_info(5)), &frame),
            Outcome::Pending
        );
    }

    #[test]
    fn test_failed_update_completes_in_flight_request() {
        let queue = SendQueue::new(8);
        let nodes = NodeRegistry::new();
        let state = ControllerState::new();
        let listeners = Listeners::new();
        let ctx = HandlerContext::new(&queue, &nodes, &state, &listeners);

        let frame = DataFrame::new(
            MessageType::Request,
            MessageClass::ApplicationUpdate,
            &[0x81, 0x00],
        );

        assert_eq!(
            ApplicationUpdateHandler.handle(&ctx, Some(&request_node_info(5)), &frame),
            Outcome::Complete
        );
        assert_eq!(ApplicationUpdateHandler.handle(&ctx, None, &frame), Outcome::Pending);
    }
}
