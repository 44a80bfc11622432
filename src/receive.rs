//! The receive loop worker.

use std::io::{self, Error, ErrorKind, Read, Write};
use std::sync::Arc;
use std::thread::{spawn, JoinHandle};

use log::{debug, error, trace, warn};

use crate::frame::{DataFrame, RawFrame};
use crate::protocol::ControlByte;
use crate::shared::Shared;
use crate::signal::Cause;

/// The reader worker.
///
/// Reads single bytes off the port, reassembles SOF frames, acknowledges
/// valid ones and feeds them to the message processors, and translates
/// control bytes into completion-latch signals.
pub(crate) struct ReceiveLoop<R, W> {
    reader: R,
    shared: Arc<Shared<W>>,
}

impl<R, W> ReceiveLoop<R, W>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    /// Spawns the receive loop thread.
    pub fn spawn(reader: R, shared: Arc<Shared<W>>) -> JoinHandle<()> {
        spawn(move || Self { reader, shared }.run())
    }

    fn run(mut self) {
        debug!("Receive loop started.");

        // Resynchronise the stick: a NAK makes it drop any half-transferred
        // frame from a previous session.
        if let Err(error) = self.shared.link.write_control(ControlByte::Nak) {
            warn!("Failed to send resync NAK: {error}");
        }

        while self.shared.is_running() {
            match self.read_byte() {
                Ok(Some(byte)) => self.handle_byte(byte),
                Ok(None) => {}
                Err(_) => break,
            }
        }

        debug!("Receive loop terminating.");
    }

    /// Reads one byte. `Ok(None)` means the inter-byte timeout elapsed.
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut buffer = [0u8; 1];

        match self.reader.read(&mut buffer) {
            Ok(0) => {
                error!("Serial port reached end of stream.");
                Err(Error::new(ErrorKind::UnexpectedEof, "End of stream."))
            }
            Ok(_) => Ok(Some(buffer[0])),
            Err(error)
                if matches!(error.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) =>
            {
                Ok(None)
            }
            Err(error) => {
                error!("Serial read failed: {error}");
                Err(error)
            }
        }
    }

    fn handle_byte(&mut self, byte: u8) {
        let counters = &self.shared.state.counters;

        match ControlByte::try_from(byte) {
            Ok(ControlByte::Sof) => self.receive_frame(),
            Ok(ControlByte::Ack) => {
                // An ACK only confirms byte reception; completion is decided
                // by the message processors.
                trace!("Received ACK.");
                counters.count_ack();
            }
            Ok(ControlByte::Nak) => {
                warn!("Received NAK.");
                counters.count_nak();
                self.shared.signal.raise(Cause::Nak);
            }
            Ok(ControlByte::Can) => {
                warn!("Received CAN.");
                counters.count_can();
                self.shared.signal.raise(Cause::Can);
            }
            Err(byte) => {
                warn!("Out-of-frame byte: {byte:#04X}.");
                counters.count_oof();

                if let Err(error) = self.shared.link.write_control(ControlByte::Nak) {
                    warn!("Failed to send NAK: {error}");
                }
            }
        }
    }

    /// Reassembles a frame after its SOF byte has been read.
    fn receive_frame(&mut self) {
        self.shared.state.counters.count_sof();

        let Some(len) = self.read_frame_byte() else {
            trace!("Frame aborted while waiting for the length byte.");
            return;
        };

        let mut buffer = RawFrame::new();
        let _ = buffer.push(ControlByte::Sof.into());
        let _ = buffer.push(len);

        for _ in 0..len {
            let Some(byte) = self.read_frame_byte() else {
                trace!("Frame aborted after {} of {len} bytes.", buffer.len() - 2);
                return;
            };

            let _ = buffer.push(byte);
        }

        match DataFrame::try_from(buffer.as_slice()) {
            Ok(frame) => {
                trace!("Received {frame}: {frame:#04X}");

                if let Err(error) = self.shared.link.write_control(ControlByte::Ack) {
                    warn!("Failed to ACK {frame}: {error}");
                }

                self.shared.handle_frame(&frame);
            }
            Err(error) => {
                // No ACK: the stick retransmits on its own timeout.
                warn!("Dropping invalid frame: {error}");
            }
        }
    }

    /// Reads one byte of an ongoing frame. A timeout mid-frame abandons the
    /// frame; hard errors surface on the next outer read.
    fn read_frame_byte(&mut self) -> Option<u8> {
        self.read_byte().ok().flatten()
    }
}
