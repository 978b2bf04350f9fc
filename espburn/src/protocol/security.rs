//! GET_SECURITY_INFO reply decoding.

use {
    crate::error::{Error, Result},
    byteorder::{ByteOrder, LittleEndian},
};

/// Reply length on ESP32-S2, which lacks chip id and API version.
pub const SECURITY_INFO_LEN_SHORT: usize = 12;

/// Reply length on ESP32-S3 and later.
pub const SECURITY_INFO_LEN_FULL: usize = 20;

/// Secure boot and flash encryption state reported by the ROM.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SecurityInfo {
    /// Security flag bits.
    pub flags: u32,
    /// SPI boot crypt counter.
    pub flash_crypt_cnt: u8,
    /// Purposes of the seven key blocks.
    pub key_purposes: [u8; 7],
    /// Chip id (absent on ESP32-S2).
    pub chip_id: Option<u32>,
    /// Loader API version (absent on ESP32-S2).
    pub api_version: Option<u32>,
}

impl SecurityInfo {
    /// Decode the data portion of a GET_SECURITY_INFO reply.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != SECURITY_INFO_LEN_SHORT && data.len() < SECURITY_INFO_LEN_FULL {
            return Err(Error::Protocol(format!(
                "security info reply has {} bytes",
                data.len()
            )));
        }

        let mut key_purposes = [0u8; 7];
        key_purposes.copy_from_slice(&data[5..12]);
        let full = data.len() >= SECURITY_INFO_LEN_FULL;

        Ok(Self {
            flags: LittleEndian::read_u32(&data[0..4]),
            flash_crypt_cnt: data[4],
            key_purposes,
            chip_id: full.then(|| LittleEndian::read_u32(&data[12..16])),
            api_version: full.then(|| LittleEndian::read_u32(&data[16..20])),
        })
    }

    /// Whether secure boot is enabled (flag bit 0).
    pub fn secure_boot_enabled(&self) -> bool {
        self.flags & 1 != 0
    }

    /// Whether flash encryption is active (odd number of crypt counter bits).
    pub fn flash_encryption_enabled(&self) -> bool {
        self.flash_crypt_cnt.count_ones() % 2 == 1
    }
}
