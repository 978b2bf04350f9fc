//! Error types for espburn.

use std::io;
use thiserror::Error;

/// Result type for espburn operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for espburn operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No matching response arrived within the allowed attempts.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The loader answered a command with a non-zero status.
    #[error("Command 0x{opcode:02X} failed with status {status:02X?}")]
    CommandFailed {
        /// Opcode of the rejected command.
        opcode: u8,
        /// Raw trailing status bytes of the response.
        status: Vec<u8>,
    },

    /// The magic register value matched no known chip family.
    #[error("Unsupported chip: magic value 0x{0:08X}")]
    UnsupportedChip(u32),

    /// Reset and sync never produced a listening bootloader.
    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    /// Flash arguments or image contents are unusable.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Stub image could not be loaded or started.
    #[error("Stub loader error: {0}")]
    Stub(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The command channel was closed while a command was pending.
    #[error("Device disconnected")]
    Disconnected,

    /// The embedding application requested the operation to stop.
    #[error("Operation interrupted")]
    Interrupted,

    /// No usable serial device was found.
    #[error("Device not found")]
    DeviceNotFound,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
