//! Unsolicited application traffic and serial API restarts.

use log::{debug, info};

use super::{HandlerContext, MessageHandler, Outcome};
use crate::frame::DataFrame;
use crate::message::{MessageClass, SerialMessage};
use crate::util::HexSlice;

/// Placeholder processor for command class frames sent to us by nodes.
///
/// Interpreting command classes is the job of the layers above the driver;
/// consumers install their own processor for
/// [`MessageClass::ApplicationCommand`] via
/// [`HandlerRegistry::register`](super::HandlerRegistry::register). The
/// built-in processor only logs the traffic.
pub struct ApplicationCommandHandler;

impl MessageHandler for ApplicationCommandHandler {
    fn handle(
        &self,
        _ctx: &HandlerContext<'_>,
        _in_flight: Option<&SerialMessage>,
        frame: &DataFrame,
    ) -> Outcome {
        debug!(
            "Unhandled application command: {:#04X}",
            HexSlice::new(frame.payload())
        );
        Outcome::Pending
    }
}

/// Handles the controller's "serial API started" notification.
///
/// The stick sends this after a soft reset; it is the only confirmation a
/// SoftReset transaction gets.
pub struct SerialApiStartedHandler;

impl MessageHandler for SerialApiStartedHandler {
    fn handle(
        &self,
        _ctx: &HandlerContext<'_>,
        in_flight: Option<&SerialMessage>,
        frame: &DataFrame,
    ) -> Outcome {
        info!("Serial API (re)started: {frame}");

        match in_flight {
            Some(message) if message.class == MessageClass::SerialApiSoftReset => {
                Outcome::Complete
            }
            _ => Outcome::Pending,
        }
    }
}
