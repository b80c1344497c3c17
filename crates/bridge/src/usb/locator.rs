//! Device location
//!
//! Finds the USB device to bridge, either by exact vendor/product ID or by
//! scanning every attached device for a printer-class interface.

use super::port::{InterfaceInfo, interfaces_of};
use common::{BridgeError, Result};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use tracing::{debug, info, warn};

/// How a device is picked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateMode {
    /// Exact vendor/product match
    Exact { vendor_id: u16, product_id: u16 },
    /// First device exposing a printer-class interface
    PrinterScan,
}

impl LocateMode {
    /// Exact lookup needs both IDs; anything less falls back to a scan
    pub fn from_ids(vendor_id: Option<u16>, product_id: Option<u16>) -> Self {
        match (vendor_id, product_id) {
            (Some(vendor_id), Some(product_id)) => LocateMode::Exact {
                vendor_id,
                product_id,
            },
            _ => LocateMode::PrinterScan,
        }
    }
}

/// Summary of an attached device for `--list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub is_printer: bool,
}

/// Create the libusb context
///
/// Failure here means no usable USB backend on this host.
pub fn usb_context() -> Result<Context> {
    Context::new().map_err(|e| {
        warn!("Failed to initialise libusb: {}", e);
        BridgeError::BackendUnavailable(e)
    })
}

/// True if any interface in the tree is printer class
pub fn has_printer_interface<'a, I>(interfaces: I) -> bool
where
    I: IntoIterator<Item = &'a InterfaceInfo>,
{
    interfaces.into_iter().any(InterfaceInfo::is_printer)
}

/// All interfaces across every configuration of a device
fn configuration_tree<T: UsbContext>(device: &Device<T>) -> Result<Vec<InterfaceInfo>> {
    let descriptor = device
        .device_descriptor()
        .map_err(BridgeError::DeviceAccess)?;

    let mut tree = Vec::new();
    for index in 0..descriptor.num_configurations() {
        let config = device
            .config_descriptor(index)
            .map_err(BridgeError::DeviceAccess)?;
        tree.extend(interfaces_of(&config));
    }
    Ok(tree)
}

fn matches<T: UsbContext>(mode: LocateMode, device: &Device<T>) -> bool {
    match mode {
        LocateMode::Exact {
            vendor_id,
            product_id,
        } => device
            .device_descriptor()
            .map(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
            .unwrap_or(false),
        LocateMode::PrinterScan => match configuration_tree(device) {
            Ok(tree) => has_printer_interface(&tree),
            Err(e) => {
                debug!(
                    "Skipping device bus={} addr={}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                false
            }
        },
    }
}

/// Find the device to bridge
pub fn locate<T: UsbContext>(
    context: &T,
    vendor_id: Option<u16>,
    product_id: Option<u16>,
) -> Result<Option<Device<T>>> {
    let mode = LocateMode::from_ids(vendor_id, product_id);
    let devices = context.devices().map_err(BridgeError::BackendUnavailable)?;

    let found = devices.iter().find(|device| matches(mode, device));
    if let Some(device) = &found {
        debug!(
            "Located device bus={} addr={} ({:?})",
            device.bus_number(),
            device.address(),
            mode
        );
    }
    Ok(found)
}

/// Turn a missing device into `DeviceNotFound`
pub fn require_device<D>(
    found: Option<D>,
    vendor_id: Option<u16>,
    product_id: Option<u16>,
) -> Result<D> {
    found.ok_or(BridgeError::DeviceNotFound {
        vendor_id,
        product_id,
    })
}

/// Locate and open the device to bridge
pub fn open_device<T: UsbContext>(
    context: &T,
    vendor_id: Option<u16>,
    product_id: Option<u16>,
) -> Result<DeviceHandle<T>> {
    let found = locate(context, vendor_id, product_id)?;
    let device = require_device(found, vendor_id, product_id)?;

    let handle = device.open().map_err(|e| {
        warn!("Failed to open device: {}", e);
        BridgeError::DeviceAccess(e)
    })?;

    info!(
        "Opened USB device bus={} addr={}",
        device.bus_number(),
        device.address()
    );
    Ok(handle)
}

/// Select configuration 1 when the device is unconfigured
///
/// Best-effort: a kernel driver bound to the device usually makes this fail,
/// and the device is then already configured anyway.
pub fn ensure_configured<T: UsbContext>(handle: &DeviceHandle<T>) {
    match handle.active_configuration() {
        Ok(0) => match handle.set_active_configuration(1) {
            Ok(()) => debug!("Selected configuration 1"),
            Err(e) => warn!("Could not select configuration 1: {}", e),
        },
        Ok(config) => debug!("Device already in configuration {}", config),
        Err(e) => debug!("Could not query active configuration: {}", e),
    }
}

/// Summarise every attached device
pub fn list_devices<T: UsbContext>(context: &T) -> Result<Vec<DeviceSummary>> {
    let devices = context.devices().map_err(BridgeError::BackendUnavailable)?;

    let mut summaries = Vec::new();
    for device in devices.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                debug!("Skipping unreadable device: {}", e);
                continue;
            }
        };
        let is_printer = configuration_tree(&device)
            .map(|tree| has_printer_interface(&tree))
            .unwrap_or(false);

        summaries.push(DeviceSummary {
            bus_number: device.bus_number(),
            address: device.address(),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            is_printer,
        });
    }
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::port::PRINTER_CLASS;

    fn iface(class_code: u8) -> InterfaceInfo {
        InterfaceInfo {
            number: 0,
            alt_setting: 0,
            class_code,
            endpoints: Vec::new(),
        }
    }

    #[test]
    fn test_locate_mode_requires_both_ids() {
        assert_eq!(
            LocateMode::from_ids(Some(0x04b8), Some(0x0202)),
            LocateMode::Exact {
                vendor_id: 0x04b8,
                product_id: 0x0202
            }
        );
        assert_eq!(
            LocateMode::from_ids(Some(0x04b8), None),
            LocateMode::PrinterScan
        );
        assert_eq!(LocateMode::from_ids(None, Some(0x0202)), LocateMode::PrinterScan);
        assert_eq!(LocateMode::from_ids(None, None), LocateMode::PrinterScan);
    }

    #[test]
    fn test_has_printer_interface() {
        assert!(has_printer_interface(&[iface(0x03), iface(PRINTER_CLASS)]));
        assert!(!has_printer_interface(&[iface(0x03), iface(0x08)]));
        assert!(!has_printer_interface(&[]));
    }

    #[test]
    fn test_require_device_reports_ids() {
        let err = require_device::<()>(None, Some(0x04b8), Some(0x0202)).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::DeviceNotFound {
                vendor_id: Some(0x04b8),
                product_id: Some(0x0202)
            }
        ));
        assert_eq!(err.exit_code(), common::error::EXIT_DEVICE_NOT_FOUND);

        assert_eq!(require_device(Some(7), None, None).unwrap(), 7);
    }

    #[test]
    fn test_list_devices_without_permissions() {
        // libusb may be missing in CI; only exercise the call
        match usb_context() {
            Ok(context) => {
                if let Err(e) = list_devices(&context) {
                    eprintln!("Device listing failed (expected without permissions): {}", e);
                }
            }
            Err(e) => {
                assert_eq!(e.exit_code(), common::error::EXIT_BACKEND_UNAVAILABLE);
            }
        }
    }
}
