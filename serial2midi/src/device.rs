//! Identity of a discoverable serial device.

use std::fmt;

use serde::Serialize;
use tokio_serial::{SerialPortInfo, SerialPortType};

/// Snapshot of one serial port as seen during a discovery pass.
///
/// Built fresh every pass and never mutated; two descriptors with the same
/// fields describe the same device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    /// OS device node (e.g., "/dev/ttyACM0")
    pub device_path: String,
    /// USB product string (if available)
    pub usb_description: Option<String>,
    /// USB vendor ID
    pub usb_vid: Option<u16>,
    /// USB product ID
    pub usb_pid: Option<u16>,
    /// USB manufacturer string (if available)
    pub usb_manufacturer: Option<String>,
}

impl DeviceDescriptor {
    /// Descriptor for a port with no USB metadata.
    pub fn bare(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            usb_description: None,
            usb_vid: None,
            usb_pid: None,
            usb_manufacturer: None,
        }
    }
}

impl From<SerialPortInfo> for DeviceDescriptor {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                device_path: info.port_name,
                usb_description: usb.product,
                usb_vid: Some(usb.vid),
                usb_pid: Some(usb.pid),
                usb_manufacturer: usb.manufacturer,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

/// The `key: value` block printed by list mode.
impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn field<T: fmt::Display>(value: &Option<T>) -> String {
            value
                .as_ref()
                .map_or_else(|| "None".to_string(), |v| v.to_string())
        }

        writeln!(f, "device_path: {}", self.device_path)?;
        writeln!(f, "usb_description: {}", field(&self.usb_description))?;
        writeln!(f, "usb_vid: {}", field(&self.usb_vid))?;
        writeln!(f, "usb_pid: {}", field(&self.usb_pid))?;
        writeln!(f, "usb_manufacturer: {}", field(&self.usb_manufacturer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_block() {
        let device = DeviceDescriptor {
            device_path: "/dev/ttyACM0".into(),
            usb_description: Some("Pico".into()),
            usb_vid: Some(0x2e8a),
            usb_pid: Some(0x000a),
            usb_manufacturer: None,
        };

        assert_eq!(
            device.to_string(),
            "device_path: /dev/ttyACM0\n\
             usb_description: Pico\n\
             usb_vid: 11914\n\
             usb_pid: 10\n\
             usb_manufacturer: None\n"
        );
    }

    #[test]
    fn test_non_usb_port_has_no_usb_fields() {
        let info = SerialPortInfo {
            port_name: "/dev/ttyS0".into(),
            port_type: SerialPortType::Unknown,
        };
        assert_eq!(DeviceDescriptor::from(info), DeviceDescriptor::bare("/dev/ttyS0"));
    }
}
