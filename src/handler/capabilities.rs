//! SerialApiGetCapabilities response processing.

use log::{debug, warn};

use super::{HandlerContext, MessageHandler, Outcome};
use crate::frame::DataFrame;
use crate::message::{MessageClass, MessageType, Priority, SerialMessage};

/// Number of bytes in the supported-function bitmask (one bit per possible
/// function ID).
const FUNCTION_MASK_BYTES: usize = 32;

/// Stores the controller's identity from a capabilities response and kicks
/// off the node enumeration.
///
/// The payload is: application version, application revision, manufacturer
/// ID, device type and device ID (each big-endian 16 bit), followed by a
/// 256-bit bitmask of supported function IDs.
pub struct CapabilitiesHandler;

impl MessageHandler for CapabilitiesHandler {
    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        _in_flight: Option<&SerialMessage>,
        frame: &DataFrame,
    ) -> Outcome {
        if frame.message_type() != MessageType::Response {
            return Outcome::Pending;
        }

        let [version, revision, m0, m1, t0, t1, i0, i1, mask @ ..] = frame.payload() else {
            warn!("Short capabilities response: {frame}");
            return Outcome::Complete;
        };

        let serial_api_version = format!("{version}.{revision}");
        let manufacturer_id = u16::from_be_bytes([*m0, *m1]);
        let device_type = u16::from_be_bytes([*t0, *t1]);
        let device_id = u16::from_be_bytes([*i0, *i1]);
        let supported_functions = supported_functions(mask);

        debug!(
            "Serial API {serial_api_version}, manufacturer {manufacturer_id:#06X}, \
             device {device_type:#06X}/{device_id:#06X}, {} supported functions.",
            supported_functions.len()
        );

        ctx.state.update_info(|info| {
            info.serial_api_version = serial_api_version;
            info.manufacturer_id = manufacturer_id;
            info.device_type = device_type;
            info.device_id = device_id;
            info.supported_functions = supported_functions;
        });

        // With the capabilities known, the node enumeration can start.
        ctx.queue.push(
            SerialMessage::request(MessageClass::SerialApiGetInitData, [])
                .with_priority(Priority::High),
        );

        Outcome::Complete
    }
}

fn supported_functions(mask: &[u8]) -> Vec<MessageClass> {
    let mut functions = Vec::new();

    for (index, byte) in mask.iter().enumerate().take(FUNCTION_MASK_BYTES) {
        for bit in 0..8 {
            if byte & (1 << bit) != 0 {
                // Bit 0 of byte 0 stands for function ID 1.
                if let Ok(class) = MessageClass::try_from((index * 8 + bit + 1) as u8) {
                    functions.push(class);
                }
            }
        }
    }

    functions
}
