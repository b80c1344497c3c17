//! Common error types

use thiserror::Error;

/// Exit code for a clean shutdown
pub const EXIT_OK: i32 = 0;
/// Exit code when no USB backend is available
pub const EXIT_BACKEND_UNAVAILABLE: i32 = 1;
/// Exit code when no matching device was found
pub const EXIT_DEVICE_NOT_FOUND: i32 = 2;
/// Exit code for any other failure while starting the session
pub const EXIT_START_FAILED: i32 = 3;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("No IN/OUT endpoints found on the selected interface ({})", fmt_interface(*.interface))]
    NoEndpointsFound { interface: Option<u8> },

    #[error("Failed to claim interface {interface}: {source}")]
    InterfaceClaimFailed {
        interface: u8,
        #[source]
        source: rusb::Error,
    },

    #[error("Failed to allocate pseudo-terminal: {0}")]
    PtyAllocationFailed(#[source] std::io::Error),

    #[error("USB backend unavailable: {0}")]
    BackendUnavailable(#[source] rusb::Error),

    #[error("No matching USB device found (vid={}, pid={})", fmt_id(*.vendor_id), fmt_id(*.product_id))]
    DeviceNotFound {
        vendor_id: Option<u16>,
        product_id: Option<u16>,
    },

    #[error("Failed to access USB device: {0}")]
    DeviceAccess(#[source] rusb::Error),

    #[error("USB transfer timed out")]
    UsbTimeout,

    #[error("USB transfer error on endpoint {endpoint:#04x}: {source}")]
    UsbTransfer {
        endpoint: u8,
        #[source]
        source: rusb::Error,
    },

    #[error("Session is not idle and cannot be started")]
    SessionNotIdle,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Classify a USB transfer failure, keeping timeouts distinct
    pub fn from_transfer(endpoint: u8, err: rusb::Error) -> Self {
        match err {
            rusb::Error::Timeout => BridgeError::UsbTimeout,
            source => BridgeError::UsbTransfer { endpoint, source },
        }
    }

    /// Process exit code reported by the launcher for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            BridgeError::BackendUnavailable(_) => EXIT_BACKEND_UNAVAILABLE,
            BridgeError::DeviceNotFound { .. } => EXIT_DEVICE_NOT_FOUND,
            _ => EXIT_START_FAILED,
        }
    }
}

fn fmt_id(id: Option<u16>) -> String {
    match id {
        Some(id) => format!("{:#06x}", id),
        None => "any".to_string(),
    }
}

fn fmt_interface(interface: Option<u8>) -> String {
    match interface {
        Some(number) => format!("interface {}", number),
        None => "configuration has no interfaces".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            BridgeError::BackendUnavailable(rusb::Error::NotSupported).exit_code(),
            EXIT_BACKEND_UNAVAILABLE
        );
        assert_eq!(
            BridgeError::DeviceNotFound {
                vendor_id: Some(0x04b8),
                product_id: Some(0x0202),
            }
            .exit_code(),
            EXIT_DEVICE_NOT_FOUND
        );
        assert_eq!(
            BridgeError::NoEndpointsFound { interface: Some(0) }.exit_code(),
            EXIT_START_FAILED
        );
        assert_eq!(
            BridgeError::InterfaceClaimFailed {
                interface: 0,
                source: rusb::Error::Busy,
            }
            .exit_code(),
            EXIT_START_FAILED
        );
    }

    #[test]
    fn test_from_transfer_keeps_timeout_distinct() {
        assert!(matches!(
            BridgeError::from_transfer(0x81, rusb::Error::Timeout),
            BridgeError::UsbTimeout
        ));
        assert!(matches!(
            BridgeError::from_transfer(0x81, rusb::Error::NoDevice),
            BridgeError::UsbTransfer {
                endpoint: 0x81,
                source: rusb::Error::NoDevice
            }
        ));
    }

    #[test]
    fn test_device_not_found_message() {
        let err = BridgeError::DeviceNotFound {
            vendor_id: Some(0x04b8),
            product_id: None,
        };
        assert_eq!(
            err.to_string(),
            "No matching USB device found (vid=0x04b8, pid=any)"
        );
    }
}
