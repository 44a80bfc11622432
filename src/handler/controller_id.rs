//! MemoryGetId response processing.

use log::{debug, warn};

use super::{HandlerContext, MessageHandler, Outcome};
use crate::frame::DataFrame;
use crate::message::{MessageType, SerialMessage};

/// Stores the home ID and our own node ID from a MemoryGetId response.
///
/// The payload is a big-endian 32-bit home ID followed by the node ID.
pub struct ControllerIdHandler;

impl MessageHandler for ControllerIdHandler {
    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        _in_flight: Option<&SerialMessage>,
        frame: &DataFrame,
    ) -> Outcome {
        if frame.message_type() != MessageType::Response {
            return Outcome::Pending;
        }

        let [h0, h1, h2, h3, node_id, ..] = frame.payload() else {
            warn!("Short MemoryGetId response: {frame}");
            return Outcome::Complete;
        };

        let home_id = u32::from_be_bytes([*h0, *h1, *h2, *h3]);
        debug!("Home ID {home_id:#010X}, own node ID {node_id}.");

        let node_id = *node_id;
        ctx.state.update_info(|info| {
            info.home_id = home_id;
            info.own_node_id = node_id;
        });

        Outcome::Complete
    }
}
