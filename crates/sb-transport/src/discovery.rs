//! Serial address discovery
//!
//! Lists serial ports that could host a device, skipping ports that belong
//! to debug probes or are otherwise never device consoles.

use serialport::{available_ports, SerialPortType};
use tracing::info;

use crate::error::ChannelError;

/// Product string of J-Link debug probes, whose UART is not a console
pub const JLINK_PRODUCT_NAME: &str = "J-Link";

/// A serial port that may host a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialAddress {
    /// Port path (e.g., /dev/ttyUSB0, COM3)
    pub port: String,
    /// USB serial number, if the port is USB
    pub serial_number: Option<String>,
    /// USB product string
    pub product: Option<String>,
}

impl SerialAddress {
    fn from_serialport(port: String, port_type: &SerialPortType) -> Self {
        match port_type {
            SerialPortType::UsbPort(usb) => Self {
                port,
                serial_number: usb.serial_number.clone(),
                product: usb.product.clone(),
            },
            _ => Self {
                port,
                serial_number: None,
                product: None,
            },
        }
    }
}

/// Which ports to report
#[derive(Debug, Clone)]
pub struct DiscoveryFilter {
    /// Skip ports whose path contains any of these
    pub skip_ports: Vec<String>,
    /// Skip ports whose USB product contains any of these
    pub skip_products: Vec<String>,
}

impl Default for DiscoveryFilter {
    fn default() -> Self {
        Self {
            skip_ports: vec!["Bluetooth".to_string(), "debug".to_string()],
            skip_products: vec![JLINK_PRODUCT_NAME.to_string()],
        }
    }
}

impl DiscoveryFilter {
    fn skips(&self, address: &SerialAddress) -> bool {
        if self.skip_ports.iter().any(|p| address.port.contains(p.as_str())) {
            return true;
        }
        let product = address.product.as_deref().unwrap_or_default();
        self.skip_products.iter().any(|p| product.contains(p.as_str()))
    }
}

/// Enumerate serial ports that pass `filter`
pub fn serial_addresses(filter: &DiscoveryFilter) -> Result<Vec<SerialAddress>, ChannelError> {
    let ports = available_ports()?;
    let found: Vec<_> = ports
        .into_iter()
        .map(|p| SerialAddress::from_serialport(p.port_name, &p.port_type))
        .filter(|a| !filter.skips(a))
        .collect();
    info!("Found {} candidate serial port(s)", found.len());
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    fn usb(product: &str) -> SerialPortType {
        SerialPortType::UsbPort(UsbPortInfo {
            vid: 0x1366,
            pid: 0x0105,
            serial_number: Some("000123".to_string()),
            manufacturer: Some("SEGGER".to_string()),
            product: Some(product.to_string()),
        })
    }

    #[test]
    fn test_address_from_usb() {
        let addr = SerialAddress::from_serialport("/dev/ttyACM0".into(), &usb("CDC UART"));
        assert_eq!(addr.serial_number.as_deref(), Some("000123"));
        assert_eq!(addr.product.as_deref(), Some("CDC UART"));
    }

    #[test]
    fn test_default_filter_skips_jlink() {
        let filter = DiscoveryFilter::default();
        let jlink = SerialAddress::from_serialport("/dev/ttyACM0".into(), &usb("J-Link"));
        let uart = SerialAddress::from_serialport("/dev/ttyUSB0".into(), &usb("FT232R"));
        assert!(filter.skips(&jlink));
        assert!(!filter.skips(&uart));
    }

    #[test]
    fn test_default_filter_skips_bluetooth() {
        let filter = DiscoveryFilter::default();
        let bt = SerialAddress::from_serialport(
            "/dev/cu.Bluetooth-Incoming-Port".into(),
            &SerialPortType::Unknown,
        );
        assert!(filter.skips(&bt));
    }
}
