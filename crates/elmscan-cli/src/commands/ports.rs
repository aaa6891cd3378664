//! Ports command - list serial ports

use anyhow::{Context, Result};
use serialport::SerialPortType;

use crate::output::{self, PortRow};

pub fn ports() -> Result<()> {
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
    let rows: Vec<PortRow> = ports
        .into_iter()
        .map(|port| PortRow {
            kind: match port.port_type {
                SerialPortType::UsbPort(usb) => format!("usb {:04x}:{:04x}", usb.vid, usb.pid),
                SerialPortType::BluetoothPort => "bluetooth".to_string(),
                SerialPortType::PciPort => "pci".to_string(),
                SerialPortType::Unknown => "unknown".to_string(),
            },
            name: port.port_name,
        })
        .collect();
    output::print(&rows)
}
