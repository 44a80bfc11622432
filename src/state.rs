//! Controller identity, counters and driver-global flags.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::sync::RwLock;

use crate::message::MessageClass;
use crate::util::CallbackIds;

/// The Z-Wave protocol library a controller firmware is built on.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
pub enum LibraryType {
    /// The library type has not been queried yet or is unknown.
    #[default]
    Unknown = 0x00,
    /// Static controller library.
    StaticController = 0x01,
    /// Portable controller library.
    Controller = 0x02,
    /// Enhanced slave library.
    EnhancedSlave = 0x03,
    /// Slave library.
    Slave = 0x04,
    /// Installer library.
    Installer = 0x05,
    /// Routing slave library.
    RoutingSlave = 0x06,
    /// Bridge controller library.
    BridgeController = 0x07,
    /// Device-under-test library.
    DeviceUnderTest = 0x08,
}

impl From<u8> for LibraryType {
    fn from(byte: u8) -> Self {
        match byte {
            0x01 => Self::StaticController,
            0x02 => Self::Controller,
            0x03 => Self::EnhancedSlave,
            0x04 => Self::Slave,
            0x05 => Self::Installer,
            0x06 => Self::RoutingSlave,
            0x07 => Self::BridgeController,
            0x08 => Self::DeviceUnderTest,
            _ => Self::Unknown,
        }
    }
}

/// Identity and version information reported by the stick.
#[derive(Debug, Default)]
pub struct ControllerInfo {
    /// Home ID of the network.
    pub home_id: u32,
    /// The controller's own node ID.
    pub own_node_id: u8,
    /// Library version string, e.g. `Z-Wave 2.78`.
    pub library_version: String,
    /// Library type byte from the version response.
    pub library_type: LibraryType,
    /// Serial API application version, e.g. `1.0`.
    pub serial_api_version: String,
    /// Manufacturer ID from the capabilities response.
    pub manufacturer_id: u16,
    /// Device type (product type) from the capabilities response.
    pub device_type: u16,
    /// Device ID (product ID) from the capabilities response.
    pub device_id: u16,
    /// Function classes the stick supports.
    pub supported_functions: Vec<MessageClass>,
}

/// Receive and failure counters.
#[derive(Debug, Default)]
pub struct Counters {
    sof: AtomicU64,
    ack: AtomicU64,
    nak: AtomicU64,
    can: AtomicU64,
    oof: AtomicU64,
    timeouts: AtomicU64,
}

/// A point-in-time copy of the [`Counters`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CounterSnapshot {
    /// Start-of-frame bytes received.
    pub sof: u64,
    /// ACKs received.
    pub ack: u64,
    /// NAKs received.
    pub nak: u64,
    /// CANs received.
    pub can: u64,
    /// Out-of-frame-flow bytes received.
    pub oof: u64,
    /// Transactions that timed out.
    pub timeouts: u64,
}

impl Counters {
    pub(crate) fn count_sof(&self) {
        self.sof.fetch_add(1, Relaxed);
    }

    pub(crate) fn count_ack(&self) {
        self.ack.fetch_add(1, Relaxed);
    }

    pub(crate) fn count_nak(&self) {
        self.nak.fetch_add(1, Relaxed);
    }

    pub(crate) fn count_can(&self) {
        self.can.fetch_add(1, Relaxed);
    }

    pub(crate) fn count_oof(&self) {
        self.oof.fetch_add(1, Relaxed);
    }

    pub(crate) fn count_timeout(&self) {
        self.timeouts.fetch_add(1, Relaxed);
    }

    /// Returns a copy of all counter values.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            sof: self.sof.load(Relaxed),
            ack: self.ack.load(Relaxed),
            nak: self.nak.load(Relaxed),
            can: self.can.load(Relaxed),
            oof: self.oof.load(Relaxed),
            timeouts: self.timeouts.load(Relaxed),
        }
    }
}

/// Shared controller state.
#[derive(Debug, Default)]
pub struct ControllerState {
    info: RwLock<ControllerInfo>,
    initialization_complete: AtomicBool,
    callback_ids: CallbackIds,
    /// Receive and failure counters.
    pub counters: Counters,
}

impl ControllerState {
    /// Creates a fresh state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` against the identity information.
    pub fn read_info<R>(&self, f: impl FnOnce(&ControllerInfo) -> R) -> R {
        f(&self.info.read().expect("controller info lock poisoned"))
    }

    /// Runs `f` against the identity information, mutably.
    pub fn update_info<R>(&self, f: impl FnOnce(&mut ControllerInfo) -> R) -> R {
        f(&mut self.info.write().expect("controller info lock poisoned"))
    }

    /// Returns the next callback ID (`1..=255`, wrapping, never `0`).
    pub fn next_callback_id(&self) -> u8 {
        self.callback_ids.next()
    }

    /// Returns whether initialization has completed.
    pub fn is_initialization_complete(&self) -> bool {
        self.initialization_complete.load(Relaxed)
    }

    /// Marks initialization complete.
    ///
    /// Returns `true` exactly once per controller lifetime: only for the
    /// caller that performed the `false -> true` transition.
    pub fn complete_initialization(&self) -> bool {
        !self.initialization_complete.swap(true, Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::{ControllerState, LibraryType};

    #[test]
    fn test_library_type_from_byte() {
        assert_eq!(LibraryType::from(0x01), LibraryType::StaticController);
        assert_eq!(LibraryType::from(0x07), LibraryType::BridgeController);
        assert_eq!(LibraryType::from(0x7F), LibraryType::Unknown);
    }

    #[test]
    fn test_initialization_completes_once() {
        let state = ControllerState::new();
        assert!(!state.is_initialization_complete());
        assert!(state.complete_initialization());
        assert!(!state.complete_initialization());
        assert!(state.is_initialization_complete());
    }

    #[test]
    fn test_callback_ids_skip_zero() {
        let state = ControllerState::new();

        for _ in 0..600 {
            assert_ne!(state.next_callback_id(), 0);
        }
    }

    #[test]
    fn test_info_update() {
        let state = ControllerState::new();
        state.update_info(|info| info.home_id = 0xDEAD_BEEF);
        assert_eq!(state.read_info(|info| info.home_id), 0xDEAD_BEEF);
    }
}
