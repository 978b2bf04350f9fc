//! Chip families and their loader constants.
//!
//! Each family is described by a [`ChipProfile`]: a plain value holding
//! magic values, register bases and block sizes. More specific families are
//! built from a more general one with struct update syntax, so a profile only
//! spells out what differs from its parent. The stub variant of a profile is
//! the same value with [`ChipProfile::is_stub`] set and the stub's block and
//! status sizes swapped in.

use {crate::protocol::channel::Loader, std::fmt};

/// Register holding the chip-detect magic value on every family.
pub const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

/// Flash write block size of every stub loader.
pub const STUB_FLASH_WRITE_SIZE: u32 = 0x4000;

/// Status length of every stub loader.
pub const STUB_STATUS_BYTES_LEN: usize = 2;

/// Supported chip families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ChipFamily {
    /// ESP8266 / ESP8285.
    Esp8266,
    /// ESP32.
    Esp32,
    /// ESP32-S2.
    Esp32s2,
    /// ESP32-S3.
    Esp32s3,
    /// ESP32-C3.
    Esp32c3,
    /// ESP32-C2.
    Esp32c2,
    /// ESP32-C6.
    Esp32c6,
}

impl ChipFamily {
    /// Magic-value matching order, least to most specific.
    pub const DETECTION_ORDER: [Self; 7] = [
        Self::Esp8266,
        Self::Esp32,
        Self::Esp32s2,
        Self::Esp32s3,
        Self::Esp32c3,
        Self::Esp32c2,
        Self::Esp32c6,
    ];

    /// The ROM profile of this family.
    pub fn profile(self) -> &'static ChipProfile {
        match self {
            Self::Esp8266 => &ESP8266,
            Self::Esp32 => &ESP32,
            Self::Esp32s2 => &ESP32_S2,
            Self::Esp32s3 => &ESP32_S3,
            Self::Esp32c3 => &ESP32_C3,
            Self::Esp32c2 => &ESP32_C2,
            Self::Esp32c6 => &ESP32_C6,
        }
    }

    /// Find the family whose magic values include `magic`.
    pub fn from_magic(magic: u32) -> Option<Self> {
        Self::DETECTION_ORDER
            .into_iter()
            .find(|family| {
                family
                    .profile()
                    .magic_values
                    .contains(&magic)
            })
    }

    /// Parse a family from a user-supplied name such as `esp32s3` or `ESP32-S3`.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "esp8266" | "esp8285" => Some(Self::Esp8266),
            "esp32" => Some(Self::Esp32),
            "esp32s2" => Some(Self::Esp32s2),
            "esp32s3" => Some(Self::Esp32s3),
            "esp32c3" => Some(Self::Esp32c3),
            "esp32c2" => Some(Self::Esp32c2),
            "esp32c6" => Some(Self::Esp32c6),
            _ => None,
        }
    }
}

impl fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(
            self.profile()
                .name,
        )
    }
}

/// Flash size tokens of the ESP8266 image header.
pub const ESP8266_FLASH_SIZES: &[(&str, u8)] = &[
    ("512KB", 0x00),
    ("256KB", 0x10),
    ("1MB", 0x20),
    ("2MB", 0x30),
    ("4MB", 0x40),
    ("2MB-c1", 0x50),
    ("4MB-c1", 0x60),
    ("8MB", 0x80),
    ("16MB", 0x90),
];

/// Flash size tokens of the ESP32-family image header.
pub const ESP32_FLASH_SIZES: &[(&str, u8)] = &[
    ("1MB", 0x00),
    ("2MB", 0x10),
    ("4MB", 0x20),
    ("8MB", 0x30),
    ("16MB", 0x40),
    ("32MB", 0x50),
    ("64MB", 0x60),
    ("128MB", 0x70),
];

/// Constants and capabilities of one chip family's loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipProfile {
    /// Family this profile describes.
    pub family: ChipFamily,
    /// Human-readable family name.
    pub name: &'static str,
    /// Accepted values of the magic register (one per silicon revision).
    pub magic_values: &'static [u32],
    /// Base address of the efuse controller.
    pub efuse_base: u32,
    /// Trailing status bytes in each response.
    pub status_bytes_len: usize,
    /// Flash data block size.
    pub flash_write_size: u32,
    /// RAM data block size.
    pub ram_write_size: u32,
    /// Flash erase sector size.
    pub flash_sector_size: u32,
    /// Flash address of the second-stage bootloader image.
    pub bootloader_flash_offset: u32,
    /// Flash size token to header byte.
    pub flash_sizes: &'static [(&'static str, u8)],
    /// Whether the loader implements the FLASH_DEFL_* commands.
    pub supports_compression: bool,
    /// Whether SPI flash must be attached with a zero-size FLASH_BEGIN.
    pub needs_spi_attach: bool,
    /// Whether this is the stub loader rather than the ROM.
    pub is_stub: bool,
}

const LOADER_DEFAULTS: ChipProfile = ChipProfile {
    family: ChipFamily::Esp8266,
    name: "ESP8266",
    magic_values: &[],
    efuse_base: 0,
    status_bytes_len: 2,
    flash_write_size: 0x400,
    ram_write_size: 0x1800,
    flash_sector_size: 0x1000,
    bootloader_flash_offset: 0,
    flash_sizes: &[],
    supports_compression: true,
    needs_spi_attach: false,
    is_stub: false,
};

/// ESP8266 ROM loader.
pub const ESP8266: ChipProfile = ChipProfile {
    family: ChipFamily::Esp8266,
    name: "ESP8266",
    magic_values: &[0xFFF0_C101],
    efuse_base: 0x3FF0_0050,
    flash_sizes: ESP8266_FLASH_SIZES,
    supports_compression: false,
    needs_spi_attach: true,
    ..LOADER_DEFAULTS
};

/// ESP32 ROM loader.
pub const ESP32: ChipProfile = ChipProfile {
    family: ChipFamily::Esp32,
    name: "ESP32",
    magic_values: &[0x00F0_1D83],
    efuse_base: 0x3FF5_A000,
    status_bytes_len: 4,
    bootloader_flash_offset: 0x1000,
    flash_sizes: ESP32_FLASH_SIZES,
    ..LOADER_DEFAULTS
};

/// ESP32-S2 ROM loader.
pub const ESP32_S2: ChipProfile = ChipProfile {
    family: ChipFamily::Esp32s2,
    name: "ESP32-S2",
    magic_values: &[0x0000_07C6],
    efuse_base: 0x3F41_A000,
    ..ESP32
};

/// ESP32-S3 ROM loader.
pub const ESP32_S3: ChipProfile = ChipProfile {
    family: ChipFamily::Esp32s3,
    name: "ESP32-S3",
    magic_values: &[0x9],
    efuse_base: 0x6000_7000,
    bootloader_flash_offset: 0,
    ..ESP32_S2
};

/// ESP32-C3 ROM loader.
pub const ESP32_C3: ChipProfile = ChipProfile {
    family: ChipFamily::Esp32c3,
    name: "ESP32-C3",
    // eco 1+2, eco 3
    magic_values: &[0x6921_506F, 0x1B31_506F],
    efuse_base: 0x6000_8800,
    bootloader_flash_offset: 0,
    ..ESP32
};

/// ESP32-C2 ROM loader.
pub const ESP32_C2: ChipProfile = ChipProfile {
    family: ChipFamily::Esp32c2,
    name: "ESP32-C2",
    // eco 0, eco 1
    magic_values: &[0x6F51_306F, 0x7C41_A06F],
    ..ESP32_C3
};

/// ESP32-C6 ROM loader.
pub const ESP32_C6: ChipProfile = ChipProfile {
    family: ChipFamily::Esp32c6,
    name: "ESP32-C6",
    magic_values: &[0x2CE0_806F],
    efuse_base: 0x600B_0800,
    bootloader_flash_offset: 0,
    ..ESP32_S2
};

impl ChipProfile {
    /// The stub-loader counterpart of this profile.
    #[must_use]
    pub fn stub(&self) -> Self {
        Self {
            flash_write_size: STUB_FLASH_WRITE_SIZE,
            status_bytes_len: STUB_STATUS_BYTES_LEN,
            supports_compression: true,
            needs_spi_attach: false,
            is_stub: true,
            ..*self
        }
    }

    /// The command-channel binding for this loader.
    pub fn loader(&self) -> Loader {
        if self.is_stub {
            Loader::Stub {
                status_len: self.status_bytes_len,
            }
        } else {
            Loader::Rom {
                status_len: self.status_bytes_len,
            }
        }
    }

    /// Header byte for a flash size token, if this family knows it.
    pub fn flash_size_value(&self, token: &str) -> Option<u8> {
        self.flash_sizes
            .iter()
            .find(|(name, _)| *name == token)
            .map(|&(_, value)| value)
    }

    /// Number of bytes the loader must be told to erase for a write of
    /// `size` bytes at `offset`.
    ///
    /// The ESP8266 ROM erases roughly twice what it is asked to inside the
    /// first 16-sector block, so the request is shrunk to compensate. Every
    /// other loader, including the ESP8266 stub, erases exactly `size`.
    pub fn erase_size(&self, offset: u32, size: u32) -> u32 {
        if self.family != ChipFamily::Esp8266 || self.is_stub {
            return size;
        }

        const SECTORS_PER_BLOCK: u32 = 16;
        let sector_size = self.flash_sector_size;
        let num_sectors = size.div_ceil(sector_size);
        let start_sector = offset / sector_size;

        let head_sectors = (SECTORS_PER_BLOCK - start_sector % SECTORS_PER_BLOCK).min(num_sectors);

        if num_sectors < 2 * head_sectors {
            num_sectors.div_ceil(2) * sector_size
        } else {
            (num_sectors - head_sectors) * sector_size
        }
    }

    /// Number of flash blocks needed for `size` bytes.
    pub fn flash_blocks(&self, size: u32) -> u32 {
        size.div_ceil(self.flash_write_size)
    }
}
