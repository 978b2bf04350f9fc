//! Flash arguments and image preparation.
//!
//! Firmware containers are unpacked elsewhere; this module only deals with
//! the result: an ordered list of [`Partition`]s plus the optional flash
//! mode, frequency and size overrides written into the bootloader header.
//!
//! ## Example
//!
//! ```rust
//! use espburn::image::{FlashArgs, FlashMode, Partition};
//!
//! let args = FlashArgs::new(vec![Partition::new(0x10000, vec![0xAA; 100])])
//!     .with_flash_mode(FlashMode::Dio);
//! assert_eq!(args.partitions.len(), 1);
//! ```

use {
    crate::{
        error::{Error, Result},
        target::chip::ChipProfile,
    },
    log::warn,
    std::{fmt, str::FromStr},
};

/// First byte of every application and bootloader image.
pub const ESP_IMAGE_MAGIC: u8 = 0xE9;

/// Filler byte for alignment padding (erased flash reads as all ones).
pub const PAD_BYTE: u8 = 0xFF;

const KEEP: &str = "keep";

/// SPI flash access mode written into the bootloader header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlashMode {
    /// Leave the header as built.
    #[default]
    Keep,
    /// Quad I/O.
    Qio,
    /// Quad output.
    Qout,
    /// Dual I/O.
    Dio,
    /// Dual output.
    Dout,
}

impl FlashMode {
    /// Header byte 2 value, or `None` for [`FlashMode::Keep`].
    pub fn header_value(self) -> Option<u8> {
        match self {
            Self::Keep => None,
            Self::Qio => Some(0),
            Self::Qout => Some(1),
            Self::Dio => Some(2),
            Self::Dout => Some(3),
        }
    }
}

impl FromStr for FlashMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            KEEP => Ok(Self::Keep),
            "qio" => Ok(Self::Qio),
            "qout" => Ok(Self::Qout),
            "dio" => Ok(Self::Dio),
            "dout" => Ok(Self::Dout),
            _ => Err(Error::InvalidImage(format!("unknown flash mode '{s}'"))),
        }
    }
}

impl fmt::Display for FlashMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Keep => KEEP,
            Self::Qio => "qio",
            Self::Qout => "qout",
            Self::Dio => "dio",
            Self::Dout => "dout",
        };
        f.write_str(name)
    }
}

/// SPI flash clock written into the low nibble of header byte 3.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlashFreq {
    /// Leave the header as built.
    #[default]
    Keep,
    /// 40 MHz.
    Freq40M,
    /// 26 MHz.
    Freq26M,
    /// 20 MHz.
    Freq20M,
    /// 80 MHz.
    Freq80M,
}

impl FlashFreq {
    /// Header nibble value, or `None` for [`FlashFreq::Keep`].
    pub fn header_value(self) -> Option<u8> {
        match self {
            Self::Keep => None,
            Self::Freq40M => Some(0x0),
            Self::Freq26M => Some(0x1),
            Self::Freq20M => Some(0x2),
            Self::Freq80M => Some(0xF),
        }
    }
}

impl FromStr for FlashFreq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            KEEP => Ok(Self::Keep),
            "40m" => Ok(Self::Freq40M),
            "26m" => Ok(Self::Freq26M),
            "20m" => Ok(Self::Freq20M),
            "80m" => Ok(Self::Freq80M),
            _ => Err(Error::InvalidImage(format!("unknown flash frequency '{s}'"))),
        }
    }
}

impl fmt::Display for FlashFreq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Keep => KEEP,
            Self::Freq40M => "40m",
            Self::Freq26M => "26m",
            Self::Freq20M => "20m",
            Self::Freq80M => "80m",
        };
        f.write_str(name)
    }
}

/// Flash size override.
///
/// The token is only validated against the chip's table at flash time,
/// since the table depends on the detected family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FlashSize {
    /// Leave the header as built.
    #[default]
    Keep,
    /// A size token such as `4MB` or `2MB-c1`.
    Token(String),
}

impl FlashSize {
    /// Header high nibble for `profile`, or `None` for [`FlashSize::Keep`].
    pub fn header_value(&self, profile: &ChipProfile) -> Result<Option<u8>> {
        match self {
            Self::Keep => Ok(None),
            Self::Token(token) => profile
                .flash_size_value(token)
                .map(Some)
                .ok_or_else(|| {
                    let supported = profile
                        .flash_sizes
                        .iter()
                        .map(|(name, _)| *name)
                        .collect::<Vec<_>>()
                        .join(", ");
                    Error::InvalidImage(format!(
                        "flash size '{token}' is not supported by {}; supported sizes: {supported}",
                        profile.name
                    ))
                }),
        }
    }
}

impl FromStr for FlashSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidImage("empty flash size".into()));
        }
        if s.eq_ignore_ascii_case(KEEP) {
            Ok(Self::Keep)
        } else {
            Ok(Self::Token(s.to_string()))
        }
    }
}

impl fmt::Display for FlashSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keep => f.write_str(KEEP),
            Self::Token(token) => f.write_str(token),
        }
    }
}

/// One image to be written at a flash address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Target flash address.
    pub address: u32,
    /// Image bytes.
    pub image: Vec<u8>,
    /// Display name.
    pub name: Option<String>,
}

impl Partition {
    /// Create an unnamed partition.
    pub fn new(address: u32, image: Vec<u8>) -> Self {
        Self {
            address,
            image,
            name: None,
        }
    }

    /// Attach a display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name for log messages: the display name or the address.
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("0x{:08X}", self.address))
    }
}

/// Everything needed for one flash operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashArgs {
    /// Flash mode override.
    pub flash_mode: FlashMode,
    /// Flash frequency override.
    pub flash_freq: FlashFreq,
    /// Flash size override.
    pub flash_size: FlashSize,
    /// Images in write order.
    pub partitions: Vec<Partition>,
}

impl FlashArgs {
    /// Arguments that keep every header setting.
    pub fn new(partitions: Vec<Partition>) -> Self {
        Self {
            partitions,
            ..Self::default()
        }
    }

    /// Set the flash mode override.
    #[must_use]
    pub fn with_flash_mode(mut self, mode: FlashMode) -> Self {
        self.flash_mode = mode;
        self
    }

    /// Set the flash frequency override.
    #[must_use]
    pub fn with_flash_freq(mut self, freq: FlashFreq) -> Self {
        self.flash_freq = freq;
        self
    }

    /// Set the flash size override.
    #[must_use]
    pub fn with_flash_size(mut self, size: FlashSize) -> Self {
        self.flash_size = size;
        self
    }

    fn overrides_header(&self) -> bool {
        self.flash_mode != FlashMode::Keep
            || self.flash_freq != FlashFreq::Keep
            || self.flash_size != FlashSize::Keep
    }
}

/// Pad `image` with [`PAD_BYTE`] to a multiple of `alignment` bytes.
pub fn pad_to(image: &mut Vec<u8>, alignment: usize) {
    let remainder = image.len() % alignment;
    if remainder != 0 {
        image.resize(image.len() + alignment - remainder, PAD_BYTE);
    }
}

/// Copy and 4-byte align an image.
pub fn pad_image(image: &[u8]) -> Vec<u8> {
    let mut padded = image.to_vec();
    pad_to(&mut padded, 4);
    padded
}

/// Apply flash mode, frequency and size overrides to a bootloader image.
///
/// Only images written at the profile's bootloader offset are touched. An
/// image there that does not start with [`ESP_IMAGE_MAGIC`] is left alone
/// with a warning. Returns whether the header was changed.
pub fn patch_header(
    image: &mut [u8],
    address: u32,
    args: &FlashArgs,
    profile: &ChipProfile,
) -> Result<bool> {
    if address != profile.bootloader_flash_offset || !args.overrides_header() {
        return Ok(false);
    }
    if image.len() < 4 || image[0] != ESP_IMAGE_MAGIC {
        warn!(
            "Image at 0x{address:08X} doesn't look like an image file, not changing flash settings"
        );
        return Ok(false);
    }

    let mut mode = image[2];
    let mut freq = image[3] & 0x0F;
    let mut size = image[3] & 0xF0;

    if let Some(value) = args
        .flash_mode
        .header_value()
    {
        mode = value;
    }
    if let Some(value) = args
        .flash_freq
        .header_value()
    {
        freq = value;
    }
    if let Some(value) = args
        .flash_size
        .header_value(profile)?
    {
        size = value;
    }

    image[2] = mode;
    image[3] = freq | size;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::target::chip::{ESP32, ESP32_C3, ESP8266},
    };

    fn bootloader() -> Vec<u8> {
        vec![ESP_IMAGE_MAGIC, 0x03, 0x02, 0x20, 0x00, 0x00]
    }

    #[test]
    fn test_pad_image_to_word_boundary() {
        assert_eq!(pad_image(&[1, 2, 3, 4]), vec![1, 2, 3, 4]);
        assert_eq!(pad_image(&[1, 2, 3, 4, 5]), vec![1, 2, 3, 4, 5, 0xFF, 0xFF, 0xFF]);
        assert!(pad_image(&[]).is_empty());
    }

    #[test]
    fn test_pad_to_block() {
        let mut data = vec![0u8; 5];
        pad_to(&mut data, 16);
        assert_eq!(data.len(), 16);
        assert!(data[5..].iter().all(|&b| b == PAD_BYTE));
    }

    #[test]
    fn test_parse_tokens() {
        assert_eq!("DIO".parse::<FlashMode>().unwrap(), FlashMode::Dio);
        assert_eq!("keep".parse::<FlashMode>().unwrap(), FlashMode::Keep);
        assert!("fast".parse::<FlashMode>().is_err());
        assert_eq!("80m".parse::<FlashFreq>().unwrap(), FlashFreq::Freq80M);
        assert!("60m".parse::<FlashFreq>().is_err());
        assert_eq!("4MB".parse::<FlashSize>().unwrap(), FlashSize::Token("4MB".into()));
        assert_eq!("Keep".parse::<FlashSize>().unwrap(), FlashSize::Keep);
        assert_eq!(FlashFreq::Freq26M.to_string(), "26m");
    }

    #[test]
    fn test_patch_header_applies_overrides() {
        let mut image = bootloader();
        let args = FlashArgs::default()
            .with_flash_mode(FlashMode::Dout)
            .with_flash_freq(FlashFreq::Freq80M)
            .with_flash_size(FlashSize::Token("16MB".into()));
        assert!(patch_header(&mut image, 0x1000, &args, &ESP32).unwrap());
        assert_eq!(image[2], 3);
        assert_eq!(image[3], 0x4F);
    }

    #[test]
    fn test_patch_header_keep_preserves_fields() {
        let mut image = bootloader();
        let args = FlashArgs::default().with_flash_freq(FlashFreq::Freq20M);
        patch_header(&mut image, 0x1000, &args, &ESP32).unwrap();
        assert_eq!(image[2], 0x02);
        assert_eq!(image[3], 0x22);
    }

    #[test]
    fn test_patch_header_zero_size_value_is_accepted() {
        let mut image = bootloader();
        let args = FlashArgs::default().with_flash_size(FlashSize::Token("1MB".into()));
        patch_header(&mut image, 0x1000, &args, &ESP32).unwrap();
        assert_eq!(image[3], 0x00);
    }

    #[test]
    fn test_patch_header_only_at_bootloader_offset() {
        let mut image = bootloader();
        let args = FlashArgs::default().with_flash_mode(FlashMode::Qio);
        assert!(!patch_header(&mut image, 0x10000, &args, &ESP32).unwrap());
        assert_eq!(image, bootloader());

        // bootloader lives at 0 on newer families
        assert!(patch_header(&mut image, 0, &args, &ESP32_C3).unwrap());
        assert_eq!(image[2], 0);
    }

    #[test]
    fn test_patch_header_skips_non_images() {
        let mut image = vec![0x00, 0x01, 0x02, 0x03];
        let args = FlashArgs::default().with_flash_mode(FlashMode::Qio);
        assert!(!patch_header(&mut image, 0, &args, &ESP8266).unwrap());
        assert_eq!(image, vec![0x00, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_patch_header_rejects_unknown_size() {
        let mut image = bootloader();
        let args = FlashArgs::default().with_flash_size(FlashSize::Token("2MB-c1".into()));
        let err = patch_header(&mut image, 0x1000, &args, &ESP32).unwrap_err();
        assert!(matches!(err, Error::InvalidImage(msg) if msg.contains("2MB-c1")));

        let mut image = bootloader();
        patch_header(&mut image, 0, &args, &ESP8266).unwrap();
        assert_eq!(image[3] & 0xF0, 0x50);
    }

    #[test]
    fn test_partition_label() {
        assert_eq!(Partition::new(0x8000, vec![]).label(), "0x00008000");
        assert_eq!(Partition::new(0, vec![]).with_name("boot").label(), "boot");
    }
}
