//! USB to pseudo-terminal bridge
//!
//! Exposes a USB device (typically a printer) as a pseudo-terminal so any
//! application that can write to a serial-like device file can talk to it.
//!
//! The entry point is [`BridgeSession`]: give it an opened device, call
//! [`BridgeSession::start`] to get the slave path, and [`BridgeSession::stop`]
//! to tear everything down again.

pub mod forward;
pub mod pty;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb;

pub use forward::LoopExit;
pub use pty::{OpenPty, TerminalPair, TerminalProvisioner};
pub use session::{BridgeSession, SessionOptions, SessionState};
pub use usb::UsbPort;
