//! Serial port access.

use std::io::{self, Error, ErrorKind, Write};
use std::sync::Mutex;
use std::time::Duration;

pub use serialport::TTYPort;
use serialport::{DataBits, FlowControl, Parity, StopBits};

use crate::util::HexSlice;

/// Baud rate of the Serial API.
pub const BAUD_RATE: u32 = 115_200;

/// Reopens the transport after an I/O failure, yielding a fresh
/// (reader, writer) pair for the respawned workers.
pub type PortFactory<R, W> = Box<dyn Fn() -> io::Result<(R, W)> + Send>;

/// Opens the named serial port at 115200-8N1 without flow control.
///
/// The returned port blocks reads for at most `receive_timeout` between
/// bytes.
///
/// # Errors
///
/// Returns a [`serialport::Error`] if the port does not exist, is in use or
/// cannot be configured.
pub fn open(path: &str, receive_timeout: Duration) -> serialport::Result<TTYPort> {
    serialport::new(path, BAUD_RATE)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(receive_timeout)
        .open_native()
}

/// The write half of the serial connection.
///
/// Both the transaction engine and the receive loop write to the port
/// (frames and aborts on one side, ACK/NAK on the other); a mutex makes
/// each write-and-flush atomic with respect to the others.
#[derive(Debug)]
pub struct SerialLink<W> {
    writer: Mutex<Option<W>>,
}

impl<W> SerialLink<W> {
    /// Creates a link around the given write half.
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Creates a link that is not connected to anything yet.
    #[must_use]
    pub const fn disconnected() -> Self {
        Self {
            writer: Mutex::new(None),
        }
    }

    /// Installs a new write half, returning the previous one.
    pub fn replace(&self, writer: W) -> Option<W> {
        self.writer
            .lock()
            .expect("serial link lock poisoned")
            .replace(writer)
    }

    /// Drops the write half. Idempotent.
    pub fn disconnect(&self) -> Option<W> {
        self.writer.lock().expect("serial link lock poisoned").take()
    }

    /// Returns whether a write half is installed.
    pub fn is_connected(&self) -> bool {
        self.writer
            .lock()
            .expect("serial link lock poisoned")
            .is_some()
    }
}

impl<W> SerialLink<W>
where
    W: Write,
{
    /// Writes all bytes and flushes, atomically with respect to other
    /// writers.
    pub fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        log::trace!("Writing bytes: {:#04X}", HexSlice::new(bytes));

        let mut writer = self.writer.lock().expect("serial link lock poisoned");
        let Some(writer) = writer.as_mut() else {
            return Err(Error::new(ErrorKind::NotConnected, "Port is closed."));
        };

        writer.write_all(bytes)?;
        writer.flush()
    }

    /// Writes a single control byte.
    pub fn write_control(&self, byte: impl Into<u8>) -> io::Result<()> {
        self.write_all(&[byte.into()])
    }
}


#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::time::Duration;

    use super::{mock, SerialLink};

    #[test]
    fn test_write_is_refused_when_disconnected() {
        let link = SerialLink::<mock::MockWriter>::disconnected();
        assert!(link.write_all(&[0x06]).is_err());
        assert!(!link.is_connected());
    }

    #[test]
    fn test_write_through_link() {
        let (stick, _reader, writer) = mock::pair(Duration::from_millis(10));
        let link = SerialLink::new(writer);
        link.write_all(&[0x01, 0x03, 0x00, 0x15, 0xE9]).unwrap();
        link.write_control(0x06u8).unwrap();
        assert_eq!(stick.written(), vec![0x01, 0x03, 0x00, 0x15, 0xE9, 0x06]);
    }

    #[test]
    fn test_mock_reader_times_out() {
        let (_stick, mut reader, _writer) = mock::pair(Duration::from_millis(5));
        let mut buf = [0u8; 1];
        assert!(reader.read(&mut buf).is_err());
    }
}
