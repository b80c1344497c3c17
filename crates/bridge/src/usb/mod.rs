//! USB subsystem
//!
//! Everything the bridge does on the USB side:
//! - Device location (exact VID/PID or printer-class scan)
//! - Interface and endpoint resolution
//! - Kernel driver detach and interface claim
//! - The [`UsbPort`] seam the forwarding loops transfer through

pub mod claim;
pub mod endpoints;
pub mod locator;
pub mod port;

pub use claim::{InterfaceClaim, claim};
pub use endpoints::{Endpoint, EndpointPair, ResolvedInterface, TransferKind, resolve, resolve_port};
pub use locator::{DeviceSummary, LocateMode, list_devices, locate, open_device, usb_context};
pub use port::{EndpointInfo, InterfaceInfo, PRINTER_CLASS, UsbPort};
