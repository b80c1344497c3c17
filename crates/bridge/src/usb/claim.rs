//! Interface claim management
//!
//! Detaches a bound kernel driver, claims the interface, and undoes both on
//! release. Kernel driver handling is best-effort: some platforms have no
//! notion of it and report `NotSupported`.

use super::port::UsbPort;
use common::{BridgeError, Result};
use tracing::{debug, info, warn};

/// An interface claimed by the bridge
///
/// Consumed by [`InterfaceClaim::release`], so a claim can only be released
/// once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a claimed interface must be released"]
pub struct InterfaceClaim {
    interface: u8,
    driver_detached: bool,
}

impl InterfaceClaim {
    pub fn interface(&self) -> u8 {
        self.interface
    }

    /// Whether a kernel driver was detached and must be reattached
    pub fn driver_detached(&self) -> bool {
        self.driver_detached
    }

    /// Release the interface and reattach the kernel driver if we detached it
    ///
    /// Never fails; errors are logged and swallowed.
    pub fn release<P: UsbPort + ?Sized>(self, port: &P) {
        match port.release_interface(self.interface) {
            Ok(()) => debug!("Released interface {}", self.interface),
            Err(e) => debug!("Could not release interface {}: {}", self.interface, e),
        }

        if self.driver_detached {
            match port.attach_kernel_driver(self.interface) {
                Ok(()) => info!("Reattached kernel driver to interface {}", self.interface),
                Err(e) => warn!(
                    "Could not reattach kernel driver to interface {}: {}",
                    self.interface, e
                ),
            }
        }
    }
}

/// Detach any kernel driver and claim `interface` exclusively
pub fn claim<P: UsbPort + ?Sized>(port: &P, interface: u8) -> Result<InterfaceClaim> {
    let mut driver_detached = false;

    match port.kernel_driver_active(interface) {
        Ok(true) => match port.detach_kernel_driver(interface) {
            Ok(()) => {
                info!("Detached kernel driver from interface {}", interface);
                driver_detached = true;
            }
            Err(e) => {
                warn!(
                    "Failed to detach kernel driver from interface {}: {}",
                    interface, e
                );
            }
        },
        Ok(false) => {
            debug!("No kernel driver active on interface {}", interface);
        }
        Err(e) => {
            debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            );
        }
    }

    if let Err(source) = port.claim_interface(interface) {
        warn!("Failed to claim interface {}: {}", interface, source);
        if driver_detached && let Err(e) = port.attach_kernel_driver(interface) {
            warn!(
                "Could not reattach kernel driver to interface {}: {}",
                interface, e
            );
        }
        return Err(BridgeError::InterfaceClaimFailed { interface, source });
    }

    debug!("Claimed interface {}", interface);
    Ok(InterfaceClaim {
        interface,
        driver_detached,
    })
}
