//! Serial port discovery and USB bridge classification.
//!
//! Espressif boards reach the host either through a USB-UART bridge (CP210x,
//! CH340/CH9102, FTDI, PL2303) or through the chip's own USB peripheral. The
//! USB-Serial/JTAG controller on newer chips needs its own reset sequence, so
//! the classification here also feeds reset selection.

use {
    crate::{
        error::{Error, Result},
        target::reset::USB_JTAG_SERIAL_PID,
    },
    serde::Serialize,
};

#[cfg(feature = "native")]
use log::{debug, info, trace};

/// Espressif's USB vendor id.
pub const ESPRESSIF_VID: u16 = 0x303A;

/// Transport type for discovered endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Serial transport (UART/USB CDC).
    Serial,
    /// Unknown or unclassified transport.
    Unknown,
}

/// USB devices commonly found between a host and an Espressif chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Integrated USB-Serial/JTAG controller (ESP32-S3/C3/C6...).
    UsbJtagSerial,
    /// Espressif native USB CDC (ESP32-S2/S3 USB-OTG).
    EspressifUsb,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// WCH CH340/CH341/CH9102 USB-to-Serial converter.
    Ch340,
    /// FTDI FT232/FT2232/FT4232 USB-to-Serial converter.
    Ftdi,
    /// Prolific PL2303 USB-to-Serial converter.
    Prolific,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs. An empty PID list matches any product.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (ESPRESSIF_VID, &[USB_JTAG_SERIAL_PID], DeviceKind::UsbJtagSerial),
    (ESPRESSIF_VID, &[], DeviceKind::EspressifUsb),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], DeviceKind::Cp210x),
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x55D4, 0x55D3],
        DeviceKind::Ch340,
    ),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], DeviceKind::Prolific),
];

impl DeviceKind {
    /// Classify a USB VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && (pids.is_empty() || pids.contains(&pid)))
            .map_or(Self::Unknown, |(_, _, device)| *device)
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UsbJtagSerial => "USB-Serial/JTAG",
            Self::EspressifUsb => "Espressif USB",
            Self::Cp210x => "CP210x",
            Self::Ch340 => "CH340/CH9102",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the device was recognized.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Whether the device is Espressif silicon talking USB directly.
    pub fn is_native_usb(&self) -> bool {
        matches!(self, Self::UsbJtagSerial | Self::EspressifUsb)
    }

    /// Whether this kind should win auto-selection.
    pub fn is_high_priority(&self) -> bool {
        matches!(
            self,
            Self::UsbJtagSerial | Self::EspressifUsb | Self::Cp210x | Self::Ch340
        )
    }
}

/// Discovered device endpoint information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectedPort {
    /// Endpoint name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Transport type.
    pub transport: TransportKind,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// A serial endpoint with no USB metadata.
    pub fn serial(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Serial,
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// Attach USB ids and classify the device.
    #[must_use]
    pub fn with_usb(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self.device = DeviceKind::from_vid_pid(vid, pid);
        self
    }

    /// Whether this endpoint probably leads to an Espressif chip.
    pub fn is_likely_espressif(&self) -> bool {
        self.device
            .is_known()
    }
}

/// Detect all available endpoints with metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            return Vec::new();
        },
    };

    ports
        .into_iter()
        .map(|port_info| {
            let detected = DetectedPort::serial(port_info.port_name);
            match port_info.port_type {
                serialport::SerialPortType::UsbPort(usb) => {
                    let detected = DetectedPort {
                        manufacturer: usb.manufacturer,
                        product: usb.product,
                        serial: usb.serial_number,
                        ..detected
                    }
                    .with_usb(usb.vid, usb.pid);
                    trace!(
                        "Found USB port: {} (VID: {:04X}, PID: {:04X}, Device: {:?})",
                        detected.name, usb.vid, usb.pid, detected.device
                    );
                    detected
                },
                _ => detected,
            }
        })
        .collect()
}

/// Detect all available endpoints (no enumeration without `native`).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Detect endpoints that probably lead to an Espressif chip.
pub fn detect_espressif_ports() -> Vec<DetectedPort> {
    detect_ports()
        .into_iter()
        .filter(DetectedPort::is_likely_espressif)
        .collect()
}

/// Pick the most likely port: native USB, then preferred bridges, then any
/// known bridge, then the first port.
pub fn select_port(ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    let pick = ports
        .iter()
        .position(|p| p.device.is_native_usb())
        .or_else(|| ports.iter().position(|p| p.device.is_high_priority()))
        .or_else(|| ports.iter().position(|p| p.device.is_known()))
        .or(if ports.is_empty() { None } else { Some(0) });

    pick.map(|index| ports[index].clone())
        .ok_or(Error::DeviceNotFound)
}

/// Auto-detect a single Espressif endpoint.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let port = select_port(detect_ports())?;
    if port.device.is_known() {
        info!("Auto-detected {} device: {}", port.device.name(), port.name);
    } else {
        info!("Using first available port: {}", port.name);
    }
    Ok(port)
}

/// Auto-detect a single endpoint (no enumeration without `native`).
#[cfg(not(feature = "native"))]
pub fn auto_detect_port() -> Result<DetectedPort> {
    Err(Error::DeviceNotFound)
}
