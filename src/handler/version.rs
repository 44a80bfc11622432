//! GetVersion response processing.

use log::{debug, warn};

use super::{HandlerContext, MessageHandler, Outcome};
use crate::frame::DataFrame;
use crate::message::{MessageType, SerialMessage};
use crate::state::LibraryType;

/// Stores the library version and type from a GetVersion response.
///
/// The payload is a NUL-terminated ASCII version string (e.g.
/// `Z-Wave 2.78`) followed by the library type byte.
pub struct VersionHandler;

impl MessageHandler for VersionHandler {
    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        _in_flight: Option<&SerialMessage>,
        frame: &DataFrame,
    ) -> Outcome {
        if frame.message_type() != MessageType::Response {
            return Outcome::Pending;
        }

        let payload = frame.payload();
        let Some(terminator) = payload.iter().position(|byte| *byte == 0) else {
            warn!("Version response without a string terminator.");
            return Outcome::Complete;
        };

        let version = String::from_utf8_lossy(&payload[..terminator]).into_owned();
        let library_type = payload
            .get(terminator + 1)
            .copied()
            .map_or(LibraryType::Unknown, LibraryType::from);

        debug!("Controller library: {version} ({library_type:?})");

        ctx.state.update_info(|info| {
            info.library_version = version;
            info.library_type = library_type;
        });

        Outcome::Complete
    }
}
