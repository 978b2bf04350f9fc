//! Port abstraction for serial communication with the bootloader.
//!
//! The loader protocol needs more than a byte stream: reset strategies
//! toggle DTR/RTS, the session renegotiates the baud rate, and a background
//! reader thread consumes responses while commands are being written. The
//! [`Port`] trait captures exactly that surface so the protocol layer stays
//! independent of the concrete serial implementation.
//!
//! ```text
//! +---------------------------+
//! |  Session / Loader         |
//! +-------------+-------------+
//!               |
//! +-------------v-------------+      +-------------------------+
//! |  CommandChannel (writer)  |      |  reader thread          |
//! +-------------+-------------+      +------------+------------+
//!               |                                 |
//! +-------------v-------------+      +------------v------------+
//! |  Port                     |----->|  try_clone_reader()     |
//! +---------------------------+      +-------------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use espburn::port::{NativePort, Port, SerialConfig};
//!
//! fn main() -> espburn::Result<()> {
//!     let config = SerialConfig::new("/dev/ttyUSB0", 115_200).with_timeout(Duration::from_secs(2));
//!     let mut port = NativePort::open(&config)?;
//!     port.set_dtr(false)?;
//!     port.set_rts(true)?;
//!     println!("USB product id: {:?}", port.usb_pid());
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::{
    io::{Read, Write},
    time::Duration,
};

use crate::error::Result;

/// Read timeout of the handle owned by the background reader.
pub const DEFAULT_READER_POLL: Duration = Duration::from_millis(20);

/// How to open a serial endpoint.
///
/// Loaders always talk 8N1 without flow control, so only the name, the
/// initial baud rate and the timeouts are configurable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Initial baud rate.
    pub baud_rate: u32,
    /// Timeout of blocking writes on the command side.
    pub timeout: Duration,
    /// Read timeout of the background reader handle. Bounds how long the
    /// reader takes to notice a close.
    pub reader_poll: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115_200,
            timeout: Duration::from_secs(1),
            reader_poll: DEFAULT_READER_POLL,
        }
    }
}

impl SerialConfig {
    /// Configuration for `port_name` at `baud_rate`.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the write timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the reader poll interval.
    #[must_use]
    pub fn with_reader_poll(mut self, poll: Duration) -> Self {
        self.reader_poll = poll;
        self
    }
}

/// The transport a loader session runs over.
///
/// Besides the byte stream this covers the two control lines used by the
/// reset strategies, baud rate changes, and a second read handle for the
/// background reader. Only the session and reset strategies touch the
/// control lines and baud rate, never while a command is in flight.
pub trait Port: Read + Write + Send {
    /// Device name, for messages.
    fn name(&self) -> &str;

    /// Switch the host side to `baud_rate`.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Current host side baud rate.
    fn baud_rate(&self) -> u32;

    /// Drop anything buffered in either direction.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Drive DTR. On auto-reset circuits this pulls IO0 (strapping pin) low.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Drive RTS. On auto-reset circuits this pulls EN (chip reset) low.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Open an independent read handle on the same device.
    ///
    /// The handle is owned by the background reader thread. Its reads must
    /// time out regularly (returning [`std::io::ErrorKind::TimedOut`]) so the
    /// thread can notice cancellation.
    fn try_clone_reader(&self) -> Result<Box<dyn Read + Send>>;

    /// USB product id of the device behind this port, if known.
    ///
    /// Only used to pick a reset strategy.
    fn usb_pid(&self) -> Option<u16> {
        None
    }

    /// Release the device. Further I/O fails.
    fn close(&mut self) -> Result<()>;

    /// Write one encoded frame and flush it.
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.write_all(frame)?;
        self.flush()?;
        Ok(())
    }
}

#[cfg(feature = "native")]
pub use native::NativePort;
