//! USB port abstraction
//!
//! The bridge never talks to libusb directly. Everything it needs from an
//! opened device goes through [`UsbPort`], which is implemented for
//! `rusb::DeviceHandle` and for the scripted mock in `test_utils`.

use super::endpoints::{Endpoint, TransferKind};
use rusb::{ConfigDescriptor, DeviceHandle, TransferType, UsbContext};
use std::sync::Arc;
use std::time::Duration;

/// USB interface class code for printers
pub const PRINTER_CLASS: u8 = 0x07;

/// Snapshot of one endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub max_packet_size: u16,
    pub transfer_type: TransferType,
}

impl EndpointInfo {
    /// Bit 7 of the address set means device-to-host
    pub fn is_in(&self) -> bool {
        (self.address & 0x80) != 0
    }
}

/// Snapshot of one interface descriptor (one alternate setting)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    pub alt_setting: u8,
    pub class_code: u8,
    pub endpoints: Vec<EndpointInfo>,
}

impl InterfaceInfo {
    pub fn is_printer(&self) -> bool {
        self.class_code == PRINTER_CLASS
    }
}

/// Flatten a configuration descriptor into interface snapshots
///
/// Alternate settings are listed in descriptor order, so the first entry is
/// interface index 0, alternate setting 0.
pub fn interfaces_of(config: &ConfigDescriptor) -> Vec<InterfaceInfo> {
    let mut out = Vec::new();
    for interface in config.interfaces() {
        for desc in interface.descriptors() {
            out.push(InterfaceInfo {
                number: desc.interface_number(),
                alt_setting: desc.setting_number(),
                class_code: desc.class_code(),
                endpoints: desc
                    .endpoint_descriptors()
                    .map(|ep| EndpointInfo {
                        address: ep.address(),
                        max_packet_size: ep.max_packet_size(),
                        transfer_type: ep.transfer_type(),
                    })
                    .collect(),
            });
        }
    }
    out
}

/// Operations the bridge performs on an opened USB device
///
/// Implementations must be safe to call from both forwarding threads at
/// once; reads and writes are bounded by the supplied timeout.
pub trait UsbPort: Send + Sync + 'static {
    /// Interfaces of the currently active configuration
    fn active_interfaces(&self) -> Result<Vec<InterfaceInfo>, rusb::Error>;

    fn kernel_driver_active(&self, interface: u8) -> Result<bool, rusb::Error>;

    fn detach_kernel_driver(&self, interface: u8) -> Result<(), rusb::Error>;

    fn attach_kernel_driver(&self, interface: u8) -> Result<(), rusb::Error>;

    fn claim_interface(&self, interface: u8) -> Result<(), rusb::Error>;

    fn release_interface(&self, interface: u8) -> Result<(), rusb::Error>;

    /// Read from an IN endpoint, returning the number of bytes received
    fn read(
        &self,
        endpoint: &Endpoint,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;

    /// Write to an OUT endpoint, returning the number of bytes sent
    fn write(&self, endpoint: &Endpoint, data: &[u8], timeout: Duration)
    -> Result<usize, rusb::Error>;
}

impl<P: UsbPort> UsbPort for Arc<P> {
    fn active_interfaces(&self) -> Result<Vec<InterfaceInfo>, rusb::Error> {
        (**self).active_interfaces()
    }

    fn kernel_driver_active(&self, interface: u8) -> Result<bool, rusb::Error> {
        (**self).kernel_driver_active(interface)
    }

    fn detach_kernel_driver(&self, interface: u8) -> Result<(), rusb::Error> {
        (**self).detach_kernel_driver(interface)
    }

    fn attach_kernel_driver(&self, interface: u8) -> Result<(), rusb::Error> {
        (**self).attach_kernel_driver(interface)
    }

    fn claim_interface(&self, interface: u8) -> Result<(), rusb::Error> {
        (**self).claim_interface(interface)
    }

    fn release_interface(&self, interface: u8) -> Result<(), rusb::Error> {
        (**self).release_interface(interface)
    }

    fn read(
        &self,
        endpoint: &Endpoint,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        (**self).read(endpoint, buf, timeout)
    }

    fn write(
        &self,
        endpoint: &Endpoint,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        (**self).write(endpoint, data, timeout)
    }
}

impl<T: UsbContext + 'static> UsbPort for DeviceHandle<T> {
    fn active_interfaces(&self) -> Result<Vec<InterfaceInfo>, rusb::Error> {
        let config = self.device().active_config_descriptor()?;
        Ok(interfaces_of(&config))
    }

    fn kernel_driver_active(&self, interface: u8) -> Result<bool, rusb::Error> {
        DeviceHandle::kernel_driver_active(self, interface)
    }

    fn detach_kernel_driver(&self, interface: u8) -> Result<(), rusb::Error> {
        DeviceHandle::detach_kernel_driver(self, interface)
    }

    fn attach_kernel_driver(&self, interface: u8) -> Result<(), rusb::Error> {
        DeviceHandle::attach_kernel_driver(self, interface)
    }

    fn claim_interface(&self, interface: u8) -> Result<(), rusb::Error> {
        DeviceHandle::claim_interface(self, interface)
    }

    fn release_interface(&self, interface: u8) -> Result<(), rusb::Error> {
        DeviceHandle::release_interface(self, interface)
    }

    fn read(
        &self,
        endpoint: &Endpoint,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        match endpoint.kind {
            TransferKind::Bulk => self.read_bulk(endpoint.address, buf, timeout),
            TransferKind::Interrupt => self.read_interrupt(endpoint.address, buf, timeout),
        }
    }

    fn write(
        &self,
        endpoint: &Endpoint,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        match endpoint.kind {
            TransferKind::Bulk => self.write_bulk(endpoint.address, data, timeout),
            TransferKind::Interrupt => self.write_interrupt(endpoint.address, data, timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_direction() {
        let ep_in = EndpointInfo {
            address: 0x81,
            max_packet_size: 64,
            transfer_type: TransferType::Bulk,
        };
        assert!(ep_in.is_in());

        let ep_out = EndpointInfo {
            address: 0x02,
            ..ep_in
        };
        assert!(!ep_out.is_in());
    }

    #[test]
    fn test_printer_class() {
        let mut iface = InterfaceInfo {
            number: 0,
            alt_setting: 0,
            class_code: PRINTER_CLASS,
            endpoints: Vec::new(),
        };
        assert!(iface.is_printer());

        iface.class_code = 0xff;
        assert!(!iface.is_printer());
    }
}
