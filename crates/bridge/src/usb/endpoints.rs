//! Interface and endpoint resolution
//!
//! Picks the interface the bridge talks to and the IN/OUT endpoints on it.
//! The printer-class interface wins; otherwise the first interface of the
//! active configuration is used.

use super::port::{InterfaceInfo, UsbPort};
use common::{BridgeError, Result};
use rusb::TransferType;
use tracing::{debug, warn};

/// Transfer type of an endpoint the bridge can stream through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Bulk,
    Interrupt,
}

impl TransferKind {
    fn from_descriptor(transfer_type: TransferType) -> Option<Self> {
        match transfer_type {
            TransferType::Bulk => Some(TransferKind::Bulk),
            TransferType::Interrupt => Some(TransferKind::Interrupt),
            _ => None,
        }
    }
}

/// A resolved streaming endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub address: u8,
    pub max_packet_size: u16,
    pub kind: TransferKind,
}

impl Endpoint {
    /// Read buffer size: the max packet size, or `fallback` when unknown
    pub fn buffer_size(&self, fallback: usize) -> usize {
        match self.max_packet_size {
            0 => fallback,
            size => size as usize,
        }
    }
}

/// Inbound (device to host) and outbound (host to device) endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointPair {
    pub inbound: Option<Endpoint>,
    pub outbound: Option<Endpoint>,
}

/// Result of endpoint resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedInterface {
    pub number: u8,
    pub alt_setting: u8,
    pub endpoints: EndpointPair,
}

/// Resolve the interface and endpoints from an interface list
///
/// The first IN and first OUT bulk/interrupt endpoint are taken. Control and
/// isochronous endpoints are skipped.
pub fn resolve(interfaces: &[InterfaceInfo]) -> Result<ResolvedInterface> {
    let selected = interfaces
        .iter()
        .find(|iface| iface.is_printer())
        .or_else(|| interfaces.iter().find(|iface| iface.alt_setting == 0))
        .or_else(|| interfaces.first())
        .ok_or(BridgeError::NoEndpointsFound { interface: None })?;

    debug!(
        "Selected interface {} (alt {}, class {:#04x})",
        selected.number, selected.alt_setting, selected.class_code
    );

    let mut endpoints = EndpointPair::default();
    for info in &selected.endpoints {
        let Some(kind) = TransferKind::from_descriptor(info.transfer_type) else {
            debug!(
                "Skipping {:?} endpoint {:#04x}",
                info.transfer_type, info.address
            );
            continue;
        };

        let endpoint = Endpoint {
            address: info.address,
            max_packet_size: info.max_packet_size,
            kind,
        };
        let slot = if info.is_in() {
            &mut endpoints.inbound
        } else {
            &mut endpoints.outbound
        };
        if slot.is_none() {
            *slot = Some(endpoint);
        }
    }

    if endpoints.inbound.is_none() && endpoints.outbound.is_none() {
        return Err(BridgeError::NoEndpointsFound {
            interface: Some(selected.number),
        });
    }

    Ok(ResolvedInterface {
        number: selected.number,
        alt_setting: selected.alt_setting,
        endpoints,
    })
}

/// Resolve against the active configuration of an opened device
pub fn resolve_port<P: UsbPort + ?Sized>(port: &P) -> Result<ResolvedInterface> {
    let interfaces = port.active_interfaces().map_err(|e| {
        warn!("Failed to read active configuration: {}", e);
        BridgeError::NoEndpointsFound { interface: None }
    })?;
    resolve(&interfaces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::port::{EndpointInfo, PRINTER_CLASS};

    fn ep(address: u8, transfer_type: TransferType) -> EndpointInfo {
        EndpointInfo {
            address,
            max_packet_size: 64,
            transfer_type,
        }
    }

    fn iface(number: u8, alt: u8, class_code: u8, endpoints: Vec<EndpointInfo>) -> InterfaceInfo {
        InterfaceInfo {
            number,
            alt_setting: alt,
            class_code,
            endpoints,
        }
    }

    #[test]
    fn test_prefers_printer_interface() {
        let interfaces = vec![
            iface(0, 0, 0xff, vec![ep(0x81, TransferType::Bulk)]),
            iface(
                1,
                0,
                PRINTER_CLASS,
                vec![ep(0x02, TransferType::Bulk), ep(0x83, TransferType::Bulk)],
            ),
        ];

        let resolved = resolve(&interfaces).unwrap();
        assert_eq!(resolved.number, 1);
        assert_eq!(resolved.endpoints.outbound.unwrap().address, 0x02);
        assert_eq!(resolved.endpoints.inbound.unwrap().address, 0x83);
    }

    #[test]
    fn test_falls_back_to_first_interface() {
        let interfaces = vec![
            iface(0, 0, 0xff, vec![ep(0x01, TransferType::Bulk)]),
            iface(1, 0, 0x03, vec![ep(0x82, TransferType::Interrupt)]),
        ];

        let resolved = resolve(&interfaces).unwrap();
        assert_eq!(resolved.number, 0);
        assert!(resolved.endpoints.inbound.is_none());
        assert_eq!(resolved.endpoints.outbound.unwrap().address, 0x01);
    }

    #[test]
    fn test_first_matching_endpoint_wins() {
        let interfaces = vec![iface(
            0,
            0,
            PRINTER_CLASS,
            vec![
                ep(0x01, TransferType::Bulk),
                ep(0x81, TransferType::Bulk),
                ep(0x02, TransferType::Bulk),
                ep(0x82, TransferType::Interrupt),
            ],
        )];

        let resolved = resolve(&interfaces).unwrap();
        assert_eq!(resolved.endpoints.outbound.unwrap().address, 0x01);
        let inbound = resolved.endpoints.inbound.unwrap();
        assert_eq!(inbound.address, 0x81);
        assert_eq!(inbound.kind, TransferKind::Bulk);
    }

    #[test]
    fn test_skips_isochronous_and_control() {
        let interfaces = vec![iface(
            0,
            0,
            PRINTER_CLASS,
            vec![
                ep(0x81, TransferType::Isochronous),
                ep(0x00, TransferType::Control),
                ep(0x83, TransferType::Interrupt),
            ],
        )];

        let resolved = resolve(&interfaces).unwrap();
        assert_eq!(resolved.endpoints.inbound.unwrap().address, 0x83);
        assert!(resolved.endpoints.outbound.is_none());
    }

    #[test]
    fn test_no_endpoints_is_error() {
        let interfaces = vec![iface(2, 0, PRINTER_CLASS, vec![])];
        match resolve(&interfaces) {
            Err(BridgeError::NoEndpointsFound { interface }) => assert_eq!(interface, Some(2)),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_empty_configuration_is_error() {
        assert!(matches!(
            resolve(&[]),
            Err(BridgeError::NoEndpointsFound { interface: None })
        ));
    }

    #[test]
    fn test_buffer_size_fallback() {
        let endpoint = Endpoint {
            address: 0x81,
            max_packet_size: 0,
            kind: TransferKind::Bulk,
        };
        assert_eq!(endpoint.buffer_size(512), 512);

        let endpoint = Endpoint {
            max_packet_size: 64,
            ..endpoint
        };
        assert_eq!(endpoint.buffer_size(512), 64);
    }
}
