//! Driver error types.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub use crate::frame::FrameError;

/// Errors surfaced to callers of the driver.
#[derive(Clone, Debug)]
pub enum Error {
    /// The serial port could not be opened or configured.
    PortUnavailable(serialport::Error),
    /// An I/O error on the open connection.
    Io(Arc<std::io::Error>),
    /// A byte buffer did not form a valid frame.
    Frame(FrameError),
    /// The driver is not connected to a port.
    NotConnected,
    /// A message failed validation before it could be enqueued.
    InvalidMessage(&'static str),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PortUnavailable(error) => write!(f, "{error}"),
            Self::Io(error) => write!(f, "{error}"),
            Self::Frame(error) => write!(f, "{error}"),
            Self::NotConnected => write!(f, "Not connected to a serial port."),
            Self::InvalidMessage(reason) => write!(f, "Invalid message: {reason}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PortUnavailable(error) => Some(error),
            Self::Io(error) => Some(error),
            Self::Frame(error) => Some(error),
            _ => None,
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(error: serialport::Error) -> Self {
        Self::PortUnavailable(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io(Arc::new(error))
    }
}

impl From<FrameError> for Error {
    fn from(error: FrameError) -> Self {
        Self::Frame(error)
    }
}
