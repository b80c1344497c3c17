//! Common utilities for usb-pty-bridge
//!
//! This crate provides the pieces shared between the bridge library and the
//! command line launcher: the error taxonomy and logging setup.

pub mod error;
pub mod logging;

pub use error::{BridgeError, Result};
pub use logging::setup_logging;
