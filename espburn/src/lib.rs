//! # espburn
//!
//! A library for flashing Espressif chips through their serial ROM loader.
//!
//! It covers the whole path from a raw serial port to a flashed chip:
//!
//! - SLIP framing and the loader's command/response protocol
//! - Reset sequencing and SYNC to reach download mode
//! - Chip detection and efuse identity decoding
//! - Flasher stub upload and baud rate boost
//! - Compressed and raw flash writes with progress reporting
//!
//! ## Supported Chips
//!
//! ESP8266 (and ESP8285), ESP32, ESP32-S2, ESP32-S3, ESP32-C3, ESP32-C2 and
//! ESP32-C6.
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//!
//! ## Example
//!
//! ```rust,no_run
//! use espburn::{FlashArgs, Partition, Session, SessionConfig, StubStore};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stubs = StubStore::from_dir("stubs".as_ref())?;
//!     let mut session = Session::new(SessionConfig::default().with_stubs(stubs));
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let port = espburn::host::open_port("/dev/ttyUSB0")?;
//!         let chip = session.open(port)?;
//!         println!("Connected to {chip}");
//!
//!         let app = std::fs::read("app.bin")?;
//!         session.flash(&FlashArgs::new(vec![Partition::new(0x10000, app)]))?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod error;
pub mod host;
pub mod image;
pub mod loader;
pub mod port;
pub mod protocol;
pub mod session;
pub mod target;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register the callback polled between connect attempts and flash blocks.
///
/// Returning `true` aborts the running operation with [`Error::Interrupted`].
/// Only the first registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Whether the registered callback asks to stop.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    device::{DetectedPort, DeviceKind, TransportKind},
    error::{Error, Result},
    host::{auto_detect_port, discover_espressif_ports, discover_ports},
    image::{FlashArgs, FlashFreq, FlashMode, FlashSize, Partition},
    loader::{FlashProgress, StubImage, StubStore},
    port::{Port, SerialConfig},
    protocol::{FrameTracer, SecurityInfo},
    session::{ConnectEvent, Event, Session, SessionConfig, SessionState},
    target::{ChipFamily, ChipInfo, ChipProfile, ChipRevision},
};
