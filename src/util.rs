//! Miscellaneous helpers.

use core::fmt::{Formatter, Result, UpperHex};
use std::sync::atomic::{AtomicU8, Ordering::Relaxed};

/// A wrapper around a slice of bytes that formats them as hexadecimal values.
pub struct HexSlice<'a>(&'a [u8]);

impl<'a> HexSlice<'a> {
    /// Creates a new `HexSlice` from a slice of bytes.
    #[must_use]
    pub const fn new(slice: &'a [u8]) -> Self {
        Self(slice)
    }
}

impl UpperHex for HexSlice<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "[")?;

        let mut bytes = self.0.iter();

        if let Some(byte) = bytes.next() {
            UpperHex::fmt(byte, f)?;
        }

        for byte in bytes {
            write!(f, ", ")?;
            UpperHex::fmt(byte, f)?;
        }

        write!(f, "]")
    }
}

/// Generator for transaction callback IDs.
///
/// IDs are unsigned bytes in the range `1..=255`; `0` is reserved for
/// "no callback requested" and is never produced. The counter wraps from
/// `255` back to `1`.
#[derive(Debug, Default)]
pub struct CallbackIds {
    last: AtomicU8,
}

impl CallbackIds {
    /// Creates a new generator whose first ID will be `1`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last: AtomicU8::new(0),
        }
    }

    /// Returns the next callback ID.
    pub fn next(&self) -> u8 {
        self.last
            .fetch_update(Relaxed, Relaxed, |last| {
                Some(if last == u8::MAX { 1 } else { last + 1 })
            })
            .map_or(1, |last| if last == u8::MAX { 1 } else { last + 1 })
    }
}
