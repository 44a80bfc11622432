//! SOF data frames of the Serial API.

use core::fmt::{Display, Formatter, UpperHex};

use crate::message::{MessageClass, MessageType};
use crate::protocol::{checksum, ControlByte};
use crate::util::HexSlice;

/// The maximum size of a frame on the wire: SOF, length byte and up to 255
/// counted bytes.
pub const MAX_FRAME_SIZE: usize = 257;

/// The maximum payload of a single frame. The length byte counts the type,
/// class and checksum bytes besides the payload.
pub const MAX_PAYLOAD_SIZE: usize = 252;

/// A stack-allocated buffer holding one wire frame.
pub type RawFrame = heapless::Vec<u8, MAX_FRAME_SIZE>;

/// Reasons a byte buffer does not form a valid data frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FrameError {
    /// The buffer is shorter than the smallest possible frame.
    Truncated,
    /// The buffer does not start with SOF.
    MissingSof,
    /// The buffer size does not match the frame's length byte.
    LengthMismatch {
        /// Size announced by the length byte.
        expected: usize,
        /// Size of the buffer.
        found: usize,
    },
    /// The checksum does not match the frame contents.
    BadChecksum {
        /// Checksum calculated over the received bytes.
        expected: u8,
        /// Checksum byte carried by the frame.
        found: u8,
    },
    /// The message type byte is neither request nor response.
    InvalidType(u8),
    /// The payload exceeds what a single frame can carry.
    PayloadTooLarge(usize),
}

impl Display for FrameError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Truncated => write!(f, "Frame is truncated."),
            Self::MissingSof => write!(f, "Frame does not start with SOF."),
            Self::LengthMismatch { expected, found } => {
                write!(f, "Frame length mismatch: expected {expected}, got {found}.")
            }
            Self::BadChecksum { expected, found } => {
                write!(
                    f,
                    "Frame checksum mismatch: expected {expected:#04X}, got {found:#04X}."
                )
            }
            Self::InvalidType(byte) => write!(f, "Invalid message type: {byte:#04X}."),
            Self::PayloadTooLarge(size) => write!(f, "Payload too large: {size} bytes."),
        }
    }
}

impl std::error::Error for FrameError {}

/// A decoded SOF data frame.
///
/// The wire layout is `SOF | LEN | TYPE | CLASS | payload… | CKSUM`, where
/// `LEN` counts every byte after the length byte and the checksum is the
/// XOR of the bytes from `LEN` through the last payload byte, seeded with
/// `0xFF`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataFrame {
    message_type: MessageType,
    class: u8,
    payload: Vec<u8>,
}

impl DataFrame {
    /// Creates a new data frame.
    #[must_use]
    pub fn new(message_type: MessageType, class: MessageClass, payload: &[u8]) -> Self {
        Self {
            message_type,
            class: class.into(),
            payload: payload.to_vec(),
        }
    }

    /// Returns the message type.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Returns the raw class byte.
    #[must_use]
    pub const fn class(&self) -> u8 {
        self.class
    }

    /// Returns the message class, if it is one the driver knows.
    #[must_use]
    pub fn message_class(&self) -> Option<MessageClass> {
        MessageClass::try_from(self.class).ok()
    }

    /// Returns the frame payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encodes the frame into its wire representation, checksum included.
    pub fn to_bytes(&self) -> Result<RawFrame, FrameError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }

        let mut buffer = RawFrame::new();
        let _ = buffer.push(ControlByte::Sof.into());
        let _ = buffer.push(self.payload.len() as u8 + 3);
        let _ = buffer.push(self.message_type as u8);
        let _ = buffer.push(self.class);
        let _ = buffer.extend_from_slice(&self.payload);
        let _ = buffer.push(checksum(&buffer[1..]));
        Ok(buffer)
    }
}

impl Display for DataFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let direction = match self.message_type {
            MessageType::Request => "REQ",
            MessageType::Response => "RES",
        };

        match self.message_class() {
            Some(class) => write!(f, "{direction}({class:?})"),
            None => write!(f, "{direction}({:#04X})", self.class),
        }
    }
}

impl UpperHex for DataFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "DataFrame {{ type: ")?;
        UpperHex::fmt(&(self.message_type as u8), f)?;
        write!(f, ", class: ")?;
        UpperHex::fmt(&self.class, f)?;
        write!(f, ", payload: ")?;
        UpperHex::fmt(&HexSlice::new(&self.payload), f)?;
        write!(f, " }}")
    }
}

impl TryFrom<&[u8]> for DataFrame {
    type Error = FrameError;

    fn try_from(buffer: &[u8]) -> Result<Self, Self::Error> {
        let [sof, len, rest @ ..] = buffer else {
            return Err(FrameError::Truncated);
        };

        if *sof != u8::from(ControlByte::Sof) {
            return Err(FrameError::MissingSof);
        }

        if rest.len() != *len as usize || rest.len() < 3 {
            return Err(FrameError::LengthMismatch {
                expected: *len as usize,
                found: rest.len(),
            });
        }

        let expected = checksum(&buffer[1..buffer.len() - 1]);
        let found = buffer[buffer.len() - 1];

        if expected != found {
            return Err(FrameError::BadChecksum { expected, found });
        }

        let message_type =
            MessageType::try_from(rest[0]).map_err(FrameError::InvalidType)?;

        Ok(Self {
            message_type,
            class: rest[1],
            payload: rest[2..rest.len() - 1].to_vec(),
        })
    }
}
