//! SendData response and callback processing.

use log::{debug, warn};

use super::{HandlerContext, MessageHandler, Outcome};
use crate::event::{Event, NodeState};
use crate::frame::DataFrame;
use crate::message::{MessageClass, MessageType, SerialMessage};

/// Transmission reached the target (and was acknowledged).
const TRANSMIT_OK: u8 = 0x00;
/// The target did not acknowledge.
const TRANSMIT_NO_ACK: u8 = 0x01;

/// Drives a SendData transaction to completion.
///
/// The immediate response only confirms that the stick accepted the job.
/// The transaction completes when the asynchronous request callback echoes
/// the callback ID of the in-flight message; the transmit status it
/// carries feeds the target node's failure hints.
pub struct SendDataHandler;

impl SendDataHandler {
    /// Records a delivered send: the node answered, so any accumulated
    /// failure hints are stale.
    fn record_delivery(ctx: &HandlerContext<'_>, node_id: u8) {
        let recovered = ctx.nodes.with_node(node_id, |node| {
            let had_failures = node.failure_count > 0;
            node.failure_count = 0;
            had_failures
        });

        if recovered == Some(true) {
            ctx.emit(&Event::NodeStatus {
                node_id,
                state: NodeState::Alive,
            });
        }
    }

    /// Records a missing acknowledgement. Only listening nodes count: a
    /// battery node that went back to sleep is not failing.
    fn record_no_ack(ctx: &HandlerContext<'_>, node_id: u8) {
        let failures = ctx
            .nodes
            .with_node(node_id, |node| {
                if node.listening || node.frequently_listening {
                    node.failure_count += 1;
                    Some(node.failure_count)
                } else {
                    None
                }
            })
            .flatten();

        if let Some(failures) = failures {
            debug!("Node {node_id} has {failures} unacknowledged send(s).");
            ctx.emit(&Event::NodeStatus {
                node_id,
                state: NodeState::Dead,
            });
        }
    }
}

impl MessageHandler for SendDataHandler {
    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        in_flight: Option<&SerialMessage>,
        frame: &DataFrame,
    ) -> Outcome {
        match frame.message_type() {
            MessageType::Response => {
                let accepted = frame.payload().first().is_some_and(|byte| *byte != 0);

                if accepted {
                    // Delivery is pending; the callback decides the outcome.
                    Outcome::Pending
                } else {
                    warn!("SendData was rejected by the stick.");
                    Outcome::Complete
                }
            }
            MessageType::Request => {
                let [callback_id, status, ..] = frame.payload() else {
                    warn!("Short SendData callback: {frame}");
                    return Outcome::Pending;
                };

                let Some(message) = in_flight else {
                    debug!("SendData callback {callback_id} without a transaction.");
                    return Outcome::Pending;
                };

                if message.class != MessageClass::SendData
                    || message.callback_id != *callback_id
                {
                    debug!(
                        "SendData callback {callback_id} does not match the in-flight \
                         message (callback {}).",
                        message.callback_id
                    );
                    return Outcome::Pending;
                }

                match (*status, message.target_node) {
                    (TRANSMIT_OK, Some(node_id)) => {
                        debug!("SendData to node {node_id} delivered.");
                        Self::record_delivery(ctx, node_id);
                    }
                    (TRANSMIT_NO_ACK, Some(node_id)) => {
                        warn!("SendData to node {node_id} was not acknowledged.");
                        Self::record_no_ack(ctx, node_id);
                    }
                    (TRANSMIT_OK, None) => {
                        debug!("SendData delivered.");
                    }
                    (status, node_id) => {
                        warn!("SendData to node {node_id:?} failed with status {status:#04X}.");
                    }
                }

                Outcome::Complete
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Outcome, SendDataHandler};
    use crate::event::recording::Recorder;
    use crate::event::{Event, Listeners, NodeState};
    use crate::frame::DataFrame;
    use crate::handler::{HandlerContext, MessageHandler};
    use crate::message::{MessageClass, MessageType, SerialMessage};
    use crate::node::{Node, NodeRegistry};
    use crate::queue::SendQueue;
    use crate::state::ControllerState;

    fn send_data(callback_id: u8) -> SerialMessage {
        let mut message =
            SerialMessage::request(MessageClass::SendData, [5, 1, 0x20, 0x25, callback_id])
                .with_target(5);
        message.callback_id = callback_id;
        message
    }

    fn context_parts() -> (SendQueue, NodeRegistry, ControllerState, Listeners) {
        (
            SendQueue::new(8),
            NodeRegistry::new(),
            ControllerState::new(),
            Listeners::new(),
        )
    }

    fn listening_node(id: u8) -> Node {
        let mut node = Node::new(id);
        node.protocol_info_known = true;
        node.listening = true;
        node
    }

    #[test]
    fn test_accepted_response_is_not_complete() {
        let (queue, nodes, state, listeners) = context_parts();
        let ctx = HandlerContext::new(&queue, &nodes, &state, &listeners);

        let frame = DataFrame::new(MessageType::Response, MessageClass::SendData, &[0x01]);
        assert_eq!(
            SendDataHandler.handle(&ctx, Some(&send_data(1)), &frame),
            Outcome::Pending
        );
    }

    #[test]
    fn test_rejected_response_completes() {
        let (queue, nodes, state, listeners) = context_parts();
        let ctx = HandlerContext::new(&queue, &nodes, &state, &listeners);

        let frame = DataFrame::new(MessageType::Response, MessageClass::SendData, &[0x00]);
        assert_eq!(
            SendDataHandler.handle(&ctx, Some(&send_data(1)), &frame),
            Outcome::Complete
        );
    }

    #[test]
    fn test_matching_callback_completes() {
        let (queue, nodes, state, listeners) = context_parts();
        let ctx = HandlerContext::new(&queue, &nodes, &state, &listeners);

        let frame = DataFrame::new(
            MessageType::Request,
            MessageClass::SendData,
            &[0x01, 0x00, 0x00, 0x02],
        );
        assert_eq!(
            SendDataHandler.handle(&ctx, Some(&send_data(1)), &frame),
            Outcome::Complete
        );
    }

    #[test]
    fn test_mismatched_callback_is_ignored() {
        let (queue, nodes, state, listeners) = context_parts();
        let ctx = HandlerContext::new(&queue, &nodes, &state, &listeners);

        let frame = DataFrame::new(
            MessageType::Request,
            MessageClass::SendData,
            &[0x07, 0x00],
        );
        assert_eq!(
            SendDataHandler.handle(&ctx, Some(&send_data(1)), &frame),
            Outcome::Pending
        );
    }

    #[test]
    fn test_no_ack_on_listening_node_counts_and_hints_dead() {
        let (queue, nodes, state, listeners) = context_parts();
        let recorder = Recorder::new();
        listeners.add(recorder.clone());
        let ctx = HandlerContext::new(&queue, &nodes, &state, &listeners);

        nodes.add(listening_node(5));

        let no_ack = DataFrame::new(
            MessageType::Request,
            MessageClass::SendData,
            &[0x01, 0x01],
        );
        assert_eq!(
            SendDataHandler.handle(&ctx, Some(&send_data(1)), &no_ack),
            Outcome::Complete
        );

        assert_eq!(nodes.with_node(5, |node| node.failure_count), Some(1));
        assert_eq!(
            recorder.count(|event| matches!(
                event,
                Event::NodeStatus {
                    node_id: 5,
                    state: NodeState::Dead
                }
            )),
            1
        );
    }

    #[test]
    fn test_no_ack_on_battery_node_is_not_a_failure() {
        let (queue, nodes, state, listeners) = context_parts();
        let recorder = Recorder::new();
        listeners.add(recorder.clone());
        let ctx = HandlerContext::new(&queue, &nodes, &state, &listeners);

        let mut node = Node::new(5);
        node.protocol_info_known = true;
        nodes.add(node);

        let no_ack = DataFrame::new(
            MessageType::Request,
            MessageClass::SendData,
            &[0x01, 0x01],
        );
        SendDataHandler.handle(&ctx, Some(&send_data(1)), &no_ack);

        assert_eq!(nodes.with_node(5, |node| node.failure_count), Some(0));
        assert_eq!(recorder.count(|event| matches!(event, Event::NodeStatus { .. })), 0);
    }

    #[test]
    fn test_delivery_clears_failure_hints_and_hints_alive() {
        let (queue, nodes, state, listeners) = context_parts();
        let recorder = Recorder::new();
        listeners.add(recorder.clone());
        let ctx = HandlerContext::new(&queue, &nodes, &state, &listeners);

        let mut node = listening_node(5);
        node.failure_count = 2;
        nodes.add(node);

        let delivered = DataFrame::new(
            MessageType::Request,
            MessageClass::SendData,
            &[0x01, 0x00, 0x00, 0x02],
        );
        assert_eq!(
            SendDataHandler.handle(&ctx, Some(&send_data(1)), &delivered),
            Outcome::Complete
        );

        assert_eq!(nodes.with_node(5, |node| node.failure_count), Some(0));
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

        // A clean delivery on a node without prior failures stays quiet.
        SendDataHandler.handle(&ctx, Some(&send_data(1)), &delivered);
        assert_eq!(
            recorder.count(|event| matches!(event, Event::NodeStatus { .. })),
            1
        );
    }
}
