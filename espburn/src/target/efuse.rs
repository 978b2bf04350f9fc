//! Chip identity decoding from efuse and system registers.
//!
//! Every family stores its package version, silicon revision and factory MAC
//! in a different place. The decoders here only need a way to read 32-bit
//! registers, so they work the same against a live loader and a register map
//! in tests.

use {
    crate::{
        error::Result,
        port::Port,
        protocol::channel::CommandChannel,
        target::chip::{ChipFamily, ChipProfile},
    },
    std::fmt,
};

/// Anything that can read a 32-bit register by address.
pub trait RegisterRead {
    /// Read the register at `addr`.
    fn read_reg(&mut self, addr: u32) -> Result<u32>;

    /// Read word `n` of the efuse block starting at `block`.
    fn read_efuse(&mut self, block: u32, n: u32) -> Result<u32> {
        self.read_reg(block + 4 * n)
    }
}

impl<P: Port> RegisterRead for CommandChannel<P> {
    fn read_reg(&mut self, addr: u32) -> Result<u32> {
        CommandChannel::read_reg(self, addr)
    }
}

/// Silicon revision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ChipRevision {
    /// Major revision.
    pub major: u32,
    /// Minor revision.
    pub minor: u32,
}

/// Identity of a connected chip.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ChipInfo {
    /// Package model, e.g. `ESP32-D0WD-V3`.
    pub model: String,
    /// One-line description including the revision.
    pub description: String,
    /// Silicon revision.
    pub revision: ChipRevision,
    /// Factory MAC address as lowercase colon-separated hex.
    pub mac: Option<String>,
    /// In-package flash size in MB.
    pub flash_size_mb: Option<u32>,
    /// In-package PSRAM size in MB.
    pub psram_size_mb: Option<u32>,
}

impl fmt::Display for ChipInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

/// Format MAC bytes as `aa:bb:cc:dd:ee:ff`.
pub fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[allow(clippy::cast_possible_truncation)]
fn byte(word: u32, shift: u32) -> u8 {
    ((word >> shift) & 0xFF) as u8
}

/// MAC stored as two words: `hi` holds the top two bytes.
fn split_mac(lo: u32, hi: u32) -> String {
    format_mac(&[
        byte(hi, 8),
        byte(hi, 0),
        byte(lo, 24),
        byte(lo, 16),
        byte(lo, 8),
        byte(lo, 0),
    ])
}

fn versioned(model: &str, revision: ChipRevision) -> String {
    format!("{model} (revision v{}.{})", revision.major, revision.minor)
}

// ESP32 registers
const ESP32_SYSCON_DATE: u32 = 0x3FF6_607C;

// Block offsets from each family's efuse base
const BLK1_OFFSET: u32 = 0x44;
const ESP32_S3_BLK2_OFFSET: u32 = 0x5C;
const ESP32_C2_BLK2_OFFSET: u32 = 0x40;

impl ChipProfile {
    /// Read the factory MAC address.
    ///
    /// Returns `None` when the chip carries no recognizable vendor prefix
    /// (ESP8266 only).
    pub fn read_mac(&self, regs: &mut dyn RegisterRead) -> Result<Option<String>> {
        let base = self.efuse_base;
        match self.family {
            ChipFamily::Esp8266 => {
                let efuses = read_esp8266_efuses(base, regs)?;
                Ok(esp8266_mac(&efuses))
            },
            ChipFamily::Esp32 => {
                let lo = regs.read_efuse(base, 1)?;
                let hi = regs.read_efuse(base, 2)?;
                Ok(Some(split_mac(lo, hi)))
            },
            ChipFamily::Esp32s2 | ChipFamily::Esp32s3 | ChipFamily::Esp32c3 | ChipFamily::Esp32c6 => {
                let blk1 = base + BLK1_OFFSET;
                let lo = regs.read_efuse(blk1, 0)?;
                let hi = regs.read_efuse(blk1, 1)?;
                Ok(Some(split_mac(lo, hi)))
            },
            ChipFamily::Esp32c2 => {
                let blk2 = base + ESP32_C2_BLK2_OFFSET;
                let lo = regs.read_efuse(blk2, 0)?;
                let hi = regs.read_efuse(blk2, 1)?;
                Ok(Some(split_mac(lo, hi)))
            },
        }
    }

    /// Decode the chip's model, revision, MAC and in-package memory.
    pub fn chip_info(&self, regs: &mut dyn RegisterRead) -> Result<ChipInfo> {
        let mut info = match self.family {
            ChipFamily::Esp8266 => esp8266_info(self.efuse_base, regs)?,
            ChipFamily::Esp32 => esp32_info(self.efuse_base, regs)?,
            ChipFamily::Esp32s2 => esp32s2_info(self.efuse_base, regs)?,
            ChipFamily::Esp32s3 => esp32s3_info(self.efuse_base, regs)?,
            ChipFamily::Esp32c3 => esp32c3_info(self.efuse_base, regs)?,
            ChipFamily::Esp32c2 => esp32c2_info(self.efuse_base, regs)?,
            ChipFamily::Esp32c6 => esp32c6_info(self.efuse_base, regs)?,
        };
        info.mac = self.read_mac(regs)?;
        Ok(info)
    }
}

fn read_esp8266_efuses(base: u32, regs: &mut dyn RegisterRead) -> Result<[u32; 4]> {
    Ok([
        regs.read_reg(base)?,
        regs.read_reg(base + 0x4)?,
        regs.read_reg(base + 0x8)?,
        regs.read_reg(base + 0xC)?,
    ])
}

fn esp8266_mac(efuses: &[u32; 4]) -> Option<String> {
    let oui = if efuses[3] != 0 {
        [byte(efuses[3], 16), byte(efuses[3], 8), byte(efuses[3], 0)]
    } else {
        match byte(efuses[1], 16) {
            0 => [0x18, 0xFE, 0x34],
            1 => [0xAC, 0xD0, 0x74],
            _ => return None,
        }
    };
    Some(format_mac(&[
        oui[0],
        oui[1],
        oui[2],
        byte(efuses[1], 8),
        byte(efuses[1], 0),
        byte(efuses[0], 24),
    ]))
}

/// Embedded flash size of an ESP8285 in MB, if the efuse bits are coherent.
fn esp8285_flash_size(efuses: &[u32; 4]) -> Option<u32> {
    let r0_4 = efuses[0] & (1 << 4) != 0;
    let r3_25 = efuses[3] & (1 << 25) != 0;
    let r3_26 = efuses[3] & (1 << 26) != 0;
    let r3_27 = efuses[3] & (1 << 27) != 0;

    match (r0_4, r3_25, r3_27, r3_26) {
        (true, false, false, false) => Some(1),
        (true, false, false, true) | (false, true, false, false) => Some(2),
        (false, true, false, true) => Some(4),
        _ => None,
    }
}

fn esp8266_info(base: u32, regs: &mut dyn RegisterRead) -> Result<ChipInfo> {
    let efuses = read_esp8266_efuses(base, regs)?;
    let is_8285 = efuses[0] & (1 << 4) != 0 || efuses[2] & (1 << 16) != 0;

    let (model, flash_size_mb) = if is_8285 {
        let flash_size = esp8285_flash_size(&efuses);
        let grade = if efuses[0] & (1 << 5) != 0 { 'H' } else { 'N' };
        let model = match flash_size {
            Some(1) => format!("ESP8285{grade}08"),
            Some(2) => format!("ESP8285{grade}16"),
            _ => "ESP8285".to_string(),
        };
        (model, flash_size)
    } else {
        ("ESP8266EX".to_string(), None)
    };

    Ok(ChipInfo {
        description: model.clone(),
        model,
        revision: ChipRevision::default(),
        mac: None,
        flash_size_mb,
        psram_size_mb: None,
    })
}

fn esp32_info(base: u32, regs: &mut dyn RegisterRead) -> Result<ChipInfo> {
    let word3 = regs.read_efuse(base, 3)?;
    let word5 = regs.read_efuse(base, 5)?;
    let syscon_date = regs.read_reg(ESP32_SYSCON_DATE)?;

    let pkg_version = (((word3 >> 2) & 0x1) << 3) | ((word3 >> 9) & 0x7);

    let rev_bits = (((syscon_date >> 31) & 0x1) << 2) | (((word5 >> 20) & 0x1) << 1) | ((word3 >> 15) & 0x1);
    let major = match rev_bits {
        1 => 1,
        3 => 2,
        7 => 3,
        _ => 0,
    };
    let minor = (word5 >> 24) & 0x3;
    let rev3 = major == 3;
    let single_core = word3 & 0x1 != 0;

    let model = match pkg_version {
        0 if single_core => "ESP32-S0WDQ6",
        0 if rev3 => "ESP32-D0WDQ6-V3",
        0 => "ESP32-D0WDQ6",
        1 if single_core => "ESP32-S0WD",
        1 if rev3 => "ESP32-D0WD-V3",
        1 => "ESP32-D0WD",
        2 => "ESP32-D2WD",
        4 => "ESP32-U4WDH",
        5 if rev3 => "ESP32-PICO-V3",
        5 => "ESP32-PICO-D4",
        6 => "ESP32-PICO-V3-02",
        7 => "ESP32-D0WDR2-V3",
        _ => "unknown ESP32",
    };
    let flash_size_mb = match model {
        "ESP32-U4WDH" | "ESP32-PICO-V3" | "ESP32-PICO-D4" => Some(4),
        "ESP32-PICO-V3-02" => Some(8),
        _ => None,
    };
    let psram_size_mb = (model == "ESP32-PICO-V3-02").then_some(2);

    let revision = ChipRevision { major, minor };
    Ok(ChipInfo {
        model: model.to_string(),
        description: versioned(model, revision),
        revision,
        mac: None,
        flash_size_mb,
        psram_size_mb,
    })
}

fn esp32s2_info(base: u32, regs: &mut dyn RegisterRead) -> Result<ChipInfo> {
    let blk1 = base + BLK1_OFFSET;
    let word3 = regs.read_efuse(blk1, 3)?;
    let word4 = regs.read_efuse(blk1, 4)?;

    let revision = ChipRevision {
        major: (word3 >> 18) & 0x3,
        minor: (((word3 >> 20) & 0x1) << 3) | ((word4 >> 4) & 0x7),
    };
    let flash_version = (word3 >> 21) & 0xF;
    let psram_version = (word3 >> 28) & 0xF;

    let model = match (flash_version, psram_version) {
        (0, 0) => "ESP32-S2",
        (0, 1) => "ESP32-S2R2",
        (1, 0) => "ESP32-S2FH2",
        (2, 0) => "ESP32-S2FH4",
        (2, 1) => "ESP32-S2FN4R2",
        _ => "unknown ESP32-S2",
    };
    let flash_size_mb = match flash_version {
        1 => Some(2),
        2 => Some(4),
        _ => None,
    };
    let psram_size_mb = (psram_version == 1).then_some(2);

    Ok(ChipInfo {
        model: model.to_string(),
        description: versioned(model, revision),
        revision,
        mac: None,
        flash_size_mb,
        psram_size_mb,
    })
}

fn esp32s3_info(base: u32, regs: &mut dyn RegisterRead) -> Result<ChipInfo> {
    let blk1 = base + BLK1_OFFSET;
    let blk2 = base + ESP32_S3_BLK2_OFFSET;
    let word1_3 = regs.read_efuse(blk1, 3)?;
    let word1_5 = regs.read_efuse(blk1, 5)?;
    let word2_4 = regs.read_efuse(blk2, 4)?;

    let raw_major = (word1_5 >> 24) & 0x3;
    let raw_minor = (((word1_5 >> 23) & 0x1) << 3) | ((word1_3 >> 18) & 0x7);
    let blk_major = word2_4 & 0x3;
    let blk_minor = (word1_3 >> 24) & 0x7;

    // eco0 parts report a bogus revision; the block version gives them away
    let is_eco0 = raw_minor & 0x7 == 0 && blk_major == 1 && blk_minor == 1;
    let revision = if is_eco0 {
        ChipRevision::default()
    } else {
        ChipRevision {
            major: raw_major,
            minor: raw_minor,
        }
    };

    Ok(ChipInfo {
        model: "ESP32-S3".to_string(),
        description: versioned("ESP32-S3", revision),
        revision,
        mac: None,
        flash_size_mb: None,
        psram_size_mb: None,
    })
}

fn esp32c3_info(base: u32, regs: &mut dyn RegisterRead) -> Result<ChipInfo> {
    let word3 = regs.read_efuse(base + BLK1_OFFSET, 3)?;
    let pkg_version = (word3 >> 21) & 0x7;
    let chip_revision = (word3 >> 18) & 0x7;

    let model = if pkg_version == 0 { "ESP32-C3" } else { "unknown ESP32-C3" };

    Ok(ChipInfo {
        model: model.to_string(),
        description: format!("{model} (revision {chip_revision})"),
        revision: ChipRevision {
            major: chip_revision,
            minor: 0,
        },
        mac: None,
        flash_size_mb: None,
        psram_size_mb: None,
    })
}

fn esp32c2_info(base: u32, regs: &mut dyn RegisterRead) -> Result<ChipInfo> {
    let word1 = regs.read_efuse(base + ESP32_C2_BLK2_OFFSET, 1)?;
    let pkg_version = (word1 >> 22) & 0x7;
    let revision = ChipRevision {
        major: (word1 >> 20) & 0x3,
        minor: (word1 >> 16) & 0xF,
    };
    let model = if pkg_version <= 1 { "ESP32-C2" } else { "unknown ESP32-C2" };

    Ok(ChipInfo {
        model: model.to_string(),
        description: versioned(model, revision),
        revision,
        mac: None,
        flash_size_mb: None,
        psram_size_mb: None,
    })
}

fn esp32c6_info(base: u32, regs: &mut dyn RegisterRead) -> Result<ChipInfo> {
    let word3 = regs.read_efuse(base + BLK1_OFFSET, 3)?;
    let pkg_version = (word3 >> 29) & 0x7;
    let revision = ChipRevision {
        major: (word3 >> 22) & 0x3,
        minor: (word3 >> 18) & 0xF,
    };
    let model = if pkg_version == 0 { "ESP32-C6" } else { "unknown ESP32-C6" };

    Ok(ChipInfo {
        model: model.to_string(),
        description: versioned(model, revision),
        revision,
        mac: None,
        flash_size_mb: None,
        psram_size_mb: None,
    })
}
