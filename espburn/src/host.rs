//! Host-side entry points: find a port and open it for a session.

use crate::device::DetectedPort;
#[cfg(feature = "native")]
use crate::port::{NativePort, SerialConfig};

/// Discover all available serial ports.
#[must_use]
pub fn discover_ports() -> Vec<DetectedPort> {
    crate::device::detect_ports()
}

/// Discover serial ports that probably lead to an Espressif chip.
#[must_use]
pub fn discover_espressif_ports() -> Vec<DetectedPort> {
    crate::device::detect_espressif_ports()
}

/// Auto-detect a single best serial port candidate.
pub fn auto_detect_port() -> crate::Result<DetectedPort> {
    crate::device::auto_detect_port()
}

/// Open `port_name` at the ROM loader baud rate, ready for
/// [`Session::open`](crate::session::Session::open).
#[cfg(feature = "native")]
pub fn open_port(port_name: &str) -> crate::Result<NativePort> {
    NativePort::open(&SerialConfig::new(port_name, crate::session::DEFAULT_BAUD))
}
