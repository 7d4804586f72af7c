//! Candidate-port discovery for the telemetry device.
//!
//! Scans the host's serial ports for the device's USB identity
//! (VID 0x0483 / PID 0x5740). Enumeration failures are swallowed: a
//! scan that cannot run simply finds nothing.

use serde::{Deserialize, Serialize};
use serialport::{available_ports, SerialPortType};

use crate::config::is_sensor_port;

/// Metadata for a detected candidate port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorPortInfo {
    /// Serial port path (e.g. "COM3" or "/dev/ttyACM0").
    pub port: String,
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
    /// USB serial number string, if the descriptor carries one.
    pub serial_number: Option<String>,
    /// Product name string, if the descriptor carries one.
    pub product_name: Option<String>,
}

/// Find all candidate devices with full port metadata.
///
/// On macOS, `tty.*` entries are skipped so each device appears once
/// (the `cu.*` variant does not block on DCD).
pub fn find_devices() -> Vec<SensorPortInfo> {
    let mut devices = Vec::new();

    let ports = match available_ports() {
        Ok(ports) => ports,
        Err(_) => return devices,
    };

    for port in ports {
        #[cfg(target_os = "macos")]
        if port.port_name.contains("/dev/tty.") {
            continue;
        }

        if let SerialPortType::UsbPort(usb_info) = &port.port_type {
            if is_sensor_port(usb_info.vid, usb_info.pid) {
                devices.push(SensorPortInfo {
                    port: port.port_name.clone(),
                    vid: usb_info.vid,
                    pid: usb_info.pid,
                    serial_number: usb_info.serial_number.clone(),
                    product_name: usb_info.product.clone(),
                });
            }
        }
    }

    devices.sort_by(|a, b| a.port.cmp(&b.port));
    devices
}

/// List candidate port names, sorted. Never fails; an OS query error
/// yields an empty list.
pub fn list_candidate_ports() -> Vec<String> {
    find_devices().into_iter().map(|d| d.port).collect()
}

/// Normalize a port name for cross-platform open calls.
pub fn normalize_port_name(name: &str) -> String {
    #[cfg(target_os = "macos")]
    {
        if name.starts_with("/dev/tty.") {
            return name.replace("/dev/tty.", "/dev/cu.");
        }
    }

    #[cfg(target_os = "windows")]
    {
        // COM ports > 9 need the \\.\ prefix
        if name.starts_with("COM") {
            if let Ok(n) = name[3..].parse::<u32>() {
                if n > 9 {
                    return format!("\\\\.\\{}", name);
                }
            }
        }
    }

    name.to_string()
}
