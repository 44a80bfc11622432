//! Wire-level definitions of the Z-Wave Serial API framing layer.

/// Single-byte control codes exchanged outside of data frames.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum ControlByte {
    /// Start of a data frame.
    Sof = 0x01,
    /// Positive acknowledgement of a received frame.
    Ack = 0x06,
    /// Negative acknowledgement; the sender should retransmit.
    Nak = 0x15,
    /// Cancellation; the controller discarded the frame mid-transfer.
    Can = 0x18,
}

impl TryFrom<u8> for ControlByte {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x01 => Ok(Self::Sof),
            0x06 => Ok(Self::Ack),
            0x15 => Ok(Self::Nak),
            0x18 => Ok(Self::Can),
            other => Err(other),
        }
    }
}

impl From<ControlByte> for u8 {
    fn from(byte: ControlByte) -> Self {
        byte as Self
    }
}

/// Calculates the frame checksum over the given bytes.
///
/// The Serial API checksum is the XOR of all bytes from the length byte up
/// to and including the last payload byte, seeded with `0xFF`.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0xFF, |acc, byte| acc ^ byte)
}
