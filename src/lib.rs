//! Host-side driver for Z-Wave serial controllers.
//!
//! This library speaks the Z-Wave Serial API over a serial port: SOF frame
//! codec with ACK/NAK/CAN flow control, a priority-ordered send queue, a
//! transaction engine that keeps exactly one request in flight (with
//! timeout, retry and SendDataAbort escape), wake-up-aware dispatch for
//! battery nodes, node lifecycle tracking and a watchdog that respawns the
//! I/O workers and detects dead nodes.
//!
//! Interpreting command classes and presenting device state are out of
//! scope; hook into the driver through [`MessageHandler`] processors and
//! [`EventListener`] subscribers instead.

pub use controller::{Controller, Options};
pub use error::Error;
pub use event::{Event, EventListener, NodeState};
pub use frame::{DataFrame, FrameError, RawFrame, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE};
pub use handler::{HandlerContext, HandlerRegistry, MessageHandler, Outcome};
pub use message::{MessageClass, MessageType, Priority, SerialMessage, TransmitOptions};
pub use node::{Node, NodeRegistry, NodeStage};
pub use port::{open, PortFactory, SerialLink, BAUD_RATE};
pub use protocol::ControlByte;
pub use queue::SendQueue;
pub use state::{ControllerInfo, ControllerState, CounterSnapshot, Counters, LibraryType};

mod controller;
mod engine;
mod error;
mod event;
mod frame;
mod handler;
mod message;
mod node;
mod port;
mod protocol;
mod queue;
mod receive;
mod shared;
mod signal;
mod state;
mod util;
mod watchdog;
